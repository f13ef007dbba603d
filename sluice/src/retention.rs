//! Time-based retention for streams.
//!
//! Every `interval` the [`RetentionManager`] computes a threshold of
//! `now - retention` in epoch milliseconds and trims each stream: it walks up
//! to [`TRIM_BATCH`] entries in append order, deletes those whose
//! `timestamp` field is below the threshold, and stops at the first entry that
//! is not. Entries with a missing or unparsable timestamp are skipped and do
//! not stop the walk.
//!
//! Passing [`WILDCARD`] as a stream name replaces the whole name list with
//! every stream key found by scanning the keyspace. Discovery runs once per
//! [`retain`](RetentionManager::retain) call, so streams created afterwards
//! are only picked up on the next call.
//!
//! The walk relies on timestamps being non-decreasing in append order. An
//! entry stamped by a publisher whose clock ran ahead acts as a boundary and
//! shields older entries behind it until it expires itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::format_duration;
use crate::error::RetentionError;
use crate::message::EntryId;
use crate::shutdown::Shutdown;
use crate::transport::{KeyType, StreamTransport};

/// Stream name that selects every stream in the keyspace.
pub const WILDCARD: &str = "*";

/// Keys requested per scan call during discovery.
pub const SCAN_BATCH: usize = 100;

/// Maximum entries examined per stream per cycle.
pub const TRIM_BATCH: usize = 100;

/// Which streams to retain and for how long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Stream names, or [`WILDCARD`].
    pub streams: Vec<String>,
    /// Time between cycles.
    #[serde(with = "crate::config::duration")]
    pub interval: Duration,
    /// Maximum age of an entry, measured from its publish timestamp.
    #[serde(with = "crate::config::duration")]
    pub retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            streams: vec![WILDCARD.to_string()],
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(60),
        }
    }
}

/// Outcome of trimming one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimReport {
    /// The stream key.
    pub stream: String,
    /// Entries examined, including the boundary entry.
    pub scanned: usize,
    /// Entries deleted.
    pub deleted: u64,
    /// Entries skipped for a missing or unparsable timestamp.
    pub skipped: usize,
    /// The first entry at or above the threshold, if the walk reached one.
    pub boundary: Option<EntryId>,
}

/// Outcome of one retention cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The threshold used, in epoch milliseconds.
    pub threshold_ms: i64,
    /// One report per stream, in the order they were trimmed.
    pub streams: Vec<TrimReport>,
}

impl CycleReport {
    /// Total entries deleted across all streams.
    pub fn deleted(&self) -> u64 {
        self.streams.iter().map(|s| s.deleted).sum()
    }
}

/// Periodically deletes expired entries from streams.
#[derive(Debug, Clone)]
pub struct RetentionManager<T, C = SystemClock> {
    transport: T,
    clock: C,
}

impl<T: StreamTransport> RetentionManager<T> {
    /// Creates a manager using the system clock.
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock)
    }
}

impl<T: StreamTransport, C: Clock> RetentionManager<T, C> {
    /// Creates a manager that reads time from `clock`.
    pub fn with_clock(transport: T, clock: C) -> Self {
        Self { transport, clock }
    }

    /// Scans the whole keyspace and returns every key of type stream, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`RetentionError::Discovery`] if a scan or type lookup fails.
    pub async fn discover_streams(&self) -> Result<Vec<String>, RetentionError> {
        let discovery = |source| RetentionError::Discovery { source };

        let mut streams = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self
                .transport
                .scan(cursor, WILDCARD, SCAN_BATCH)
                .await
                .map_err(discovery)?;
            for key in page.keys {
                if self.transport.key_type(&key).await.map_err(discovery)? == KeyType::Stream {
                    streams.push(key);
                }
            }
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        // A full scan may return a key more than once.
        streams.sort();
        streams.dedup();
        tracing::debug!(count = streams.len(), "discovered streams");
        Ok(streams)
    }

    /// Resolves a name list: any [`WILDCARD`] means "discover everything".
    ///
    /// # Errors
    ///
    /// Returns [`RetentionError::Discovery`] if discovery was needed and failed.
    pub async fn resolve_streams(&self, names: &[String]) -> Result<Vec<String>, RetentionError> {
        if names.iter().any(|name| name == WILDCARD) {
            self.discover_streams().await
        } else {
            Ok(names.to_vec())
        }
    }

    /// Returns `now - retention` in epoch milliseconds, floored at zero.
    pub fn threshold(&self, retention: Duration) -> i64 {
        let now = i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX);
        let retention = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(retention).max(0)
    }

    /// Deletes the expired prefix of `stream`, looking at most [`TRIM_BATCH`]
    /// entries deep.
    ///
    /// # Errors
    ///
    /// Returns [`RetentionError::Trim`] if reading or deleting fails. Entries
    /// deleted before the failure stay deleted.
    pub async fn trim_stream(&self, stream: &str, threshold: i64) -> Result<TrimReport, RetentionError> {
        let trim = |source| RetentionError::Trim {
            stream: stream.to_string(),
            source,
        };

        let entries = self.transport.range(stream, TRIM_BATCH).await.map_err(trim)?;
        let mut report = TrimReport {
            stream: stream.to_string(),
            ..TrimReport::default()
        };

        for entry in &entries {
            report.scanned += 1;
            match entry.timestamp_ms() {
                None => {
                    tracing::warn!(stream, id = %entry.id, "entry has no timestamp, skipping");
                    report.skipped += 1;
                }
                Some(Err(e)) => {
                    tracing::warn!(stream, id = %entry.id, error = %e, "could not parse timestamp, skipping");
                    report.skipped += 1;
                }
                Some(Ok(ts)) if ts < threshold => {
                    report.deleted += self.transport.delete(stream, &[entry.id]).await.map_err(trim)?;
                }
                Some(Ok(_)) => {
                    report.boundary = Some(entry.id);
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Runs one cycle over `streams` with a freshly computed threshold.
    ///
    /// # Errors
    ///
    /// Returns the first [`RetentionError::Trim`]; later streams are not
    /// trimmed in that cycle.
    pub async fn run_cycle(&self, streams: &[String], retention: Duration) -> Result<CycleReport, RetentionError> {
        let threshold_ms = self.threshold(retention);
        let mut report = CycleReport {
            threshold_ms,
            streams: Vec::with_capacity(streams.len()),
        };

        for stream in streams {
            let trimmed = self.trim_stream(stream, threshold_ms).await?;
            if trimmed.deleted > 0 {
                tracing::info!(stream = %stream, deleted = trimmed.deleted, threshold_ms, "trimmed stream");
            }
            report.streams.push(trimmed);
        }
        Ok(report)
    }

    /// Trims `names` every `interval` until `shutdown` fires or a cycle fails.
    ///
    /// The first cycle runs immediately.
    ///
    /// # Errors
    ///
    /// Returns the discovery error or the first failing cycle's error. There
    /// is no retry.
    pub async fn retain(
        &self,
        names: &[String],
        interval: Duration,
        retention: Duration,
        mut shutdown: Shutdown,
    ) -> Result<(), RetentionError> {
        let streams = self.resolve_streams(names).await?;
        tracing::info!(
            streams = streams.len(),
            interval = %format_duration(interval),
            retention = %format_duration(retention),
            "retention started"
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let cycle = tokio::select! {
                biased;
                () = shutdown.triggered() => None,
                cycle = self.run_cycle(&streams, retention) => Some(cycle),
            };
            let Some(cycle) = cycle else {
                break;
            };
            let report = cycle.inspect_err(|e| tracing::error!(error = %e, "retention cycle failed"))?;
            tracing::debug!(threshold_ms = report.threshold_ms, deleted = report.deleted(), "retention cycle complete");

            tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }

        tracing::info!("retention stopped");
        Ok(())
    }

    /// Runs [`retain`](Self::retain) with the settings of a [`RetentionPolicy`].
    ///
    /// # Errors
    ///
    /// See [`retain`](Self::retain).
    pub async fn retain_policy(&self, policy: &RetentionPolicy, shutdown: Shutdown) -> Result<(), RetentionError> {
        self.retain(&policy.streams, policy.interval, policy.retention, shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryTransport;

    #[test]
    fn test_default_policy() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.streams, vec!["*"]);
        assert_eq!(policy.interval, Duration::from_secs(60));
        assert_eq!(policy.retention, Duration::from_secs(60));
    }

    #[test]
    fn test_threshold_saturates() {
        let clock = ManualClock::new(10_000);
        let manager = RetentionManager::with_clock(MemoryTransport::new(), clock.clone());
        assert_eq!(manager.threshold(Duration::from_secs(4)), 6_000);
        assert_eq!(manager.threshold(Duration::from_secs(60)), 0);

        clock.set(u64::MAX);
        assert_eq!(manager.threshold(Duration::ZERO), i64::MAX);
    }

    #[tokio::test]
    async fn test_resolve_literal_names_skips_discovery() {
        let transport = MemoryTransport::new();
        let manager = RetentionManager::new(transport.clone());
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(manager.resolve_streams(&names).await.unwrap(), names);
        assert_eq!(transport.calls(crate::memory::Operation::Scan), 0);
    }

    #[tokio::test]
    async fn test_trim_missing_stream_is_empty() {
        let manager = RetentionManager::new(MemoryTransport::new());
        let report = manager.trim_stream("ghost", 1_000).await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(report.deleted, 0);
        assert!(report.boundary.is_none());
    }

    #[test]
    fn test_cycle_report_totals() {
        let report = CycleReport {
            threshold_ms: 0,
            streams: vec![
                TrimReport {
                    deleted: 2,
                    ..TrimReport::default()
                },
                TrimReport {
                    deleted: 3,
                    ..TrimReport::default()
                },
            ],
        };
        assert_eq!(report.deleted(), 5);
    }
}
