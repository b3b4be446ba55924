use std::cmp::Ordering;

use super::record::ConnectionRecord;

/// Which records a view includes by liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    All,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Start,
    Host,
    Upload,
    Download,
    UploadSpeed,
    DownloadSpeed,
}

impl SortKey {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "start" | "time" => Some(SortKey::Start),
            "host" => Some(SortKey::Host),
            "upload" => Some(SortKey::Upload),
            "download" => Some(SortKey::Download),
            "upload-speed" | "upload_speed" | "up" => Some(SortKey::UploadSpeed),
            "download-speed" | "download_speed" | "down" => Some(SortKey::DownloadSpeed),
            _ => None,
        }
    }
}

/// Filter and ordering applied to published connection lists
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionFilter {
    /// `tcp` or `udp`; `None` keeps both
    pub network: Option<String>,
    pub state: StateFilter,
    /// Case-insensitive match over host, addresses, chains and rule
    pub query: Option<String>,
    pub sort: SortKey,
    pub descending: bool,
}

impl Default for ConnectionFilter {
    fn default() -> Self {
        Self {
            network: None,
            state: StateFilter::All,
            query: None,
            sort: SortKey::Start,
            descending: true,
        }
    }
}

impl ConnectionFilter {
    pub fn matches(&self, record: &ConnectionRecord) -> bool {
        match self.state {
            StateFilter::Active if !record.is_alive => return false,
            StateFilter::Closed if record.is_alive => return false,
            _ => {}
        }

        if let Some(network) = &self.network {
            if !record.metadata.network.eq_ignore_ascii_case(network) {
                return false;
            }
        }

        match self.query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => record.matches_text(&query.to_lowercase()),
            _ => true,
        }
    }

    fn compare(&self, a: &ConnectionRecord, b: &ConnectionRecord) -> Ordering {
        let ordering = match self.sort {
            SortKey::Start => a.start.cmp(&b.start),
            SortKey::Host => a.display_host().cmp(&b.display_host()),
            SortKey::Upload => a.upload.cmp(&b.upload),
            SortKey::Download => a.download.cmp(&b.download),
            SortKey::UploadSpeed => a.upload_speed.total_cmp(&b.upload_speed),
            SortKey::DownloadSpeed => a.download_speed.total_cmp(&b.download_speed),
        };
        // ties keep a stable order between snapshots
        let ordering = ordering.then_with(|| a.id.cmp(&b.id));
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }

    /// Matching records, sorted
    pub fn apply<'a, I>(&self, records: I) -> Vec<ConnectionRecord>
    where
        I: IntoIterator<Item = &'a ConnectionRecord>,
    {
        let mut selected: Vec<ConnectionRecord> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect();
        selected.sort_by(|a, b| self.compare(a, b));
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clash::{Connection, ConnectionMetadata};

    fn record(id: &str, network: &str, host: &str, download: u64, alive: bool) -> ConnectionRecord {
        let mut record = ConnectionRecord::from_connection(Connection {
            id: id.to_string(),
            metadata: ConnectionMetadata {
                network: network.to_string(),
                host: host.to_string(),
                ..Default::default()
            },
            upload: 0,
            download,
            start: "2025-01-10T10:00:00Z".to_string(),
            chains: vec!["Proxy".to_string(), "HK-01".to_string()],
            rule: "Match".to_string(),
            rule_payload: String::new(),
        });
        record.is_alive = alive;
        record
    }

    #[test]
    fn test_state_and_network_filter() {
        let records = vec![
            record("a", "tcp", "example.com", 10, true),
            record("b", "udp", "dns.google", 20, true),
            record("c", "tcp", "github.com", 30, false),
        ];

        let active_tcp = ConnectionFilter {
            network: Some("TCP".to_string()),
            state: StateFilter::Active,
            ..Default::default()
        };
        let ids: Vec<String> = active_tcp.apply(&records).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a"]);

        let closed = ConnectionFilter {
            state: StateFilter::Closed,
            ..Default::default()
        };
        assert_eq!(closed.apply(&records).len(), 1);
    }

    #[test]
    fn test_query_matches_host_and_chain() {
        let records = vec![
            record("a", "tcp", "example.com", 10, true),
            record("b", "tcp", "github.com", 20, true),
        ];
        let filter = ConnectionFilter {
            query: Some("GitHub".to_string()),
            ..Default::default()
        };
        assert_eq!(filter.apply(&records).len(), 1);

        let by_chain = ConnectionFilter {
            query: Some("hk-01".to_string()),
            ..Default::default()
        };
        assert_eq!(by_chain.apply(&records).len(), 2);
    }

    #[test]
    fn test_sort_by_download() {
        let records = vec![
            record("a", "tcp", "a.com", 10, true),
            record("b", "tcp", "b.com", 30, true),
            record("c", "tcp", "c.com", 20, true),
        ];
        let mut filter = ConnectionFilter {
            sort: SortKey::Download,
            descending: true,
            ..Default::default()
        };
        let ids: Vec<String> = filter.apply(&records).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        filter.descending = false;
        let ids: Vec<String> = filter.apply(&records).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }
}
