//! Instantaneous byte rates derived from cumulative counters.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

/// Id under which process-wide totals are tracked
pub const AGGREGATE_ID: &str = "__aggregate__";

const MIN_ELAPSED: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct RateSample {
    upload: u64,
    download: u64,
    at: Instant,
}

/// Upload and download rate in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub upload: f64,
    pub download: f64,
}

/// Keeps the previous sample per id. Updates for one id must arrive in
/// snapshot order.
#[derive(Debug, Default)]
pub struct RateTracker {
    samples: HashMap<String, RateSample>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and return the rate since the previous one.
    /// A first sample, or one whose counters went backwards, yields zero
    /// and becomes the new baseline.
    pub fn update(&mut self, id: &str, upload: u64, download: u64, now: Instant) -> Rates {
        let current = RateSample {
            upload,
            download,
            at: now,
        };

        let previous = match self.samples.insert(id.to_string(), current) {
            Some(previous) => previous,
            None => return Rates::default(),
        };

        if upload < previous.upload || download < previous.download {
            return Rates::default();
        }

        let elapsed = now
            .saturating_duration_since(previous.at)
            .max(MIN_ELAPSED)
            .as_secs_f64();

        Rates {
            upload: (upload - previous.upload) as f64 / elapsed,
            download: (download - previous.download) as f64 / elapsed,
        }
    }

    /// Drop every id not in `keep`
    pub fn purge(&mut self, keep: &HashSet<String>) {
        self.samples.retain(|id, _| keep.contains(id));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.samples.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
