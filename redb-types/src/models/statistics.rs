use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cdc_event::CdcOperation;

/// Per-relationship CDC counters. Created with the CDC source and dropped
/// when the relationship is removed or the process restarts; snapshots are
/// written to the metadata store on checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CdcStatistics {
    pub events_processed: u64,
    pub events_failed: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub truncates: u64,
    pub bytes_processed: u64,
    /// Moving average over all processed events, in microseconds.
    pub avg_latency_micros: f64,
    pub lag_micros: u64,
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_position: Option<String>,
}

impl CdcStatistics {
    pub fn record_event(
        &mut self,
        operation: CdcOperation,
        bytes: u64,
        latency: Duration,
        position: Option<&str>,
    ) {
        self.events_processed += 1;
        match operation {
            CdcOperation::Insert => self.inserts += 1,
            CdcOperation::Update => self.updates += 1,
            CdcOperation::Delete => self.deletes += 1,
            CdcOperation::Truncate => self.truncates += 1,
        }
        self.bytes_processed += bytes;

        let sample = latency.as_micros() as f64;
        let n = self.events_processed as f64;
        self.avg_latency_micros = (self.avg_latency_micros * (n - 1.0) + sample) / n;

        self.last_event_at = Some(Utc::now());
        if let Some(position) = position {
            self.last_position = Some(position.to_string());
        }
    }

    pub fn record_failure(&mut self) {
        self.events_failed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_latency() {
        let mut stats = CdcStatistics::default();
        stats.record_event(CdcOperation::Insert, 10, Duration::from_micros(100), None);
        stats.record_event(CdcOperation::Update, 10, Duration::from_micros(300), None);
        assert_eq!(stats.avg_latency_micros, 200.0);
        stats.record_event(CdcOperation::Delete, 10, Duration::from_micros(800), None);
        assert!((stats.avg_latency_micros - 400.0).abs() < f64::EPSILON);
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.bytes_processed, 30);
    }

    #[test]
    fn position_tracks_latest() {
        let mut stats = CdcStatistics::default();
        stats.record_event(
            CdcOperation::Insert,
            1,
            Duration::from_micros(1),
            Some("0/1"),
        );
        stats.record_event(CdcOperation::Insert, 1, Duration::from_micros(1), None);
        assert_eq!(stats.last_position.as_deref(), Some("0/1"));
    }
}
