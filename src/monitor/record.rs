use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::clash::{Connection, ConnectionMetadata, ConnectionsResponse};
use crate::rate::{RateTracker, AGGREGATE_ID};

use super::filter::ConnectionFilter;

/// One active or recently closed flow
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub id: String,
    pub metadata: ConnectionMetadata,
    pub upload: u64,
    pub download: u64,
    /// `None` when the core reported an unparseable time
    pub start: Option<DateTime<Utc>>,
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
    pub is_alive: bool,
    pub upload_speed: f64,
    pub download_speed: f64,
    missed_snapshots: u32,
}

impl ConnectionRecord {
    pub fn from_connection(connection: Connection) -> Self {
        let start = DateTime::parse_from_rfc3339(&connection.start)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        Self {
            id: connection.id,
            metadata: connection.metadata,
            upload: connection.upload,
            download: connection.download,
            start,
            chains: connection.chains,
            rule: connection.rule,
            rule_payload: connection.rule_payload,
            is_alive: true,
            upload_speed: 0.0,
            download_speed: 0.0,
            missed_snapshots: 0,
        }
    }

    fn refresh(&mut self, connection: Connection) {
        self.metadata = connection.metadata;
        self.upload = connection.upload;
        self.download = connection.download;
        self.chains = connection.chains;
        self.rule = connection.rule;
        self.rule_payload = connection.rule_payload;
        self.is_alive = true;
        self.missed_snapshots = 0;
    }

    fn mark_closed(&mut self) {
        self.is_alive = false;
        self.upload_speed = 0.0;
        self.download_speed = 0.0;
    }

    /// Host name, or destination IP for connections without one
    pub fn display_host(&self) -> String {
        if !self.metadata.host.is_empty() {
            return self.metadata.host.clone();
        }
        self.metadata.destination_ip.clone().unwrap_or_default()
    }

    pub fn destination(&self) -> String {
        format!("{}:{}", self.display_host(), self.metadata.destination_port)
    }

    /// Chain as shown to users: outermost group first
    pub fn chain_display(&self) -> String {
        self.chains
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join(" → ")
    }

    /// `needle` must already be lowercase
    pub(crate) fn matches_text(&self, needle: &str) -> bool {
        let m = &self.metadata;
        let fields = [
            m.host.as_str(),
            m.source_ip.as_str(),
            m.destination_ip.as_deref().unwrap_or(""),
            m.process_path.as_deref().unwrap_or(""),
            self.rule.as_str(),
            self.rule_payload.as_str(),
        ];
        fields
            .iter()
            .copied()
            .chain(self.chains.iter().map(String::as_str))
            .any(|field| field.to_lowercase().contains(needle))
    }
}

/// Process-wide counters and derived rates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateStats {
    pub upload_total: u64,
    pub download_total: u64,
    pub upload_speed: f64,
    pub download_speed: f64,
    pub memory: Option<u64>,
    pub active_count: usize,
    pub closed_count: usize,
}

/// Live connection map plus the rate state that belongs to it
#[derive(Debug)]
pub struct ConnectionBook {
    records: HashMap<String, ConnectionRecord>,
    rates: RateTracker,
    aggregate: AggregateStats,
    grace_snapshots: u32,
}

impl ConnectionBook {
    /// `grace_snapshots` is how many snapshots a closed id keeps its rate baseline
    pub fn new(grace_snapshots: u32) -> Self {
        Self {
            records: HashMap::new(),
            rates: RateTracker::new(),
            aggregate: AggregateStats::default(),
            grace_snapshots,
        }
    }

    /// Merge one snapshot taken at `now`
    pub fn apply(&mut self, snapshot: ConnectionsResponse, now: Instant) {
        let totals = self.rates.update(
            AGGREGATE_ID,
            snapshot.upload_total,
            snapshot.download_total,
            now,
        );
        self.aggregate.upload_total = snapshot.upload_total;
        self.aggregate.download_total = snapshot.download_total;
        self.aggregate.upload_speed = totals.upload;
        self.aggregate.download_speed = totals.download;
        if snapshot.memory.is_some() {
            self.aggregate.memory = snapshot.memory;
        }

        let mut seen = HashSet::new();
        for connection in snapshot.connections.unwrap_or_default() {
            let rates = self
                .rates
                .update(&connection.id, connection.upload, connection.download, now);
            seen.insert(connection.id.clone());

            let record = match self.records.entry(connection.id.clone()) {
                Entry::Occupied(entry) => {
                    let record = entry.into_mut();
                    record.refresh(connection);
                    record
                }
                Entry::Vacant(entry) => entry.insert(ConnectionRecord::from_connection(connection)),
            };
            record.upload_speed = rates.upload;
            record.download_speed = rates.download;
        }

        for (id, record) in self.records.iter_mut() {
            if seen.contains(id) {
                continue;
            }
            if record.is_alive {
                record.mark_closed();
            }
            record.missed_snapshots = record.missed_snapshots.saturating_add(1);
        }

        let mut keep: HashSet<String> = self
            .records
            .values()
            .filter(|r| r.missed_snapshots <= self.grace_snapshots)
            .map(|r| r.id.clone())
            .collect();
        keep.insert(AGGREGATE_ID.to_string());
        self.rates.purge(&keep);

        self.recount();
    }

    /// Flag a record closed without waiting for the next snapshot
    pub fn mark_closed(&mut self, id: &str) -> bool {
        let found = match self.records.get_mut(id) {
            Some(record) => {
                record.mark_closed();
                true
            }
            None => false,
        };
        self.recount();
        found
    }

    pub fn mark_all_closed(&mut self) {
        for record in self.records.values_mut() {
            record.mark_closed();
        }
        self.recount();
    }

    /// Remove every closed record and its rate state
    pub fn clear_closed(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_alive);

        let mut keep: HashSet<String> = self.records.keys().cloned().collect();
        keep.insert(AGGREGATE_ID.to_string());
        self.rates.purge(&keep);

        self.recount();
        before - self.records.len()
    }

    /// Drop all records and rate baselines
    pub fn reset(&mut self) {
        self.records.clear();
        self.rates.clear();
        self.aggregate = AggregateStats::default();
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn aggregate(&self) -> &AggregateStats {
        &self.aggregate
    }

    pub fn rates(&self) -> &RateTracker {
        &self.rates
    }

    pub fn view(&self, filter: &ConnectionFilter) -> Vec<ConnectionRecord> {
        filter.apply(self.records.values())
    }

    fn recount(&mut self) {
        let active = self.records.values().filter(|r| r.is_alive).count();
        self.aggregate.active_count = active;
        self.aggregate.closed_count = self.records.len() - active;
    }
}
