//! Worker loop - consumes check requests and records their outcomes
//!
//! Each cycle:
//! - Polls a bounded batch from the region's consumer group
//! - Probes every entry concurrently, isolating per-entry faults
//! - Persists the probed outcomes as one batch
//! - Acknowledges exactly the persisted entries
//!
//! Nothing is acknowledged unless the batch holding its record was stored.
//! Entries left unacknowledged are redelivered later; there is no local retry.

use anyhow::{Result, anyhow};
use futures::future::join_all;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use streams::{CLAIM_CURSOR_START, CheckLog, LogEntry};
use timeseries::{TimeSeriesSink, UptimeEventRecord};
use tracing::{debug, error, info, warn};

use crate::config::{Identity, Tuning};
use crate::monitoring::{Probe, ProbeOutcome};

#[cfg(test)]
mod tests;

/// Loop timing and batch bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub read_count: usize,
    pub read_block: Duration,
    pub idle_delay: Duration,
    /// Minimum idle time before another consumer's pending entry is taken over
    pub reclaim_idle: Option<Duration>,
}

impl From<&Tuning> for LoopSettings {
    fn from(tuning: &Tuning) -> Self {
        Self {
            read_count: tuning.read_count.max(1),
            read_block: Duration::from_millis(tuning.read_block_ms),
            idle_delay: Duration::from_millis(tuning.idle_delay_ms),
            reclaim_idle: (tuning.reclaim_idle_ms > 0)
                .then(|| Duration::from_millis(tuning.reclaim_idle_ms)),
        }
    }
}

/// What a cycle did with a delivered batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every probe faulted, nothing to persist
    NothingProbed { faulted: usize },
    /// Persistence failed, the whole batch stays pending
    Abandoned { probed: usize, faulted: usize },
    /// Records were stored and their entries acknowledged
    Completed { persisted: usize, acknowledged: usize, ack_failures: usize, faulted: usize },
}

/// Single-flight worker for one consumer in one region's group
pub struct Worker {
    log: Arc<dyn CheckLog>,
    sink: Arc<TimeSeriesSink>,
    prober: Arc<dyn Probe>,
    identity: Identity,
    settings: LoopSettings,
    /// Resume point of the stale-entry scan across polls
    claim_cursor: Mutex<String>,
}

impl Worker {
    pub fn new(
        log: Arc<dyn CheckLog>,
        sink: Arc<TimeSeriesSink>,
        prober: Arc<dyn Probe>,
        identity: Identity,
        settings: LoopSettings,
    ) -> Self {
        Self {
            log,
            sink,
            prober,
            identity,
            settings,
            claim_cursor: Mutex::new(CLAIM_CURSOR_START.to_string()),
        }
    }

    fn claim_cursor(&self) -> MutexGuard<'_, String> {
        self.claim_cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn group(&self) -> &str {
        &self.identity.region_id
    }

    fn consumer(&self) -> &str {
        &self.identity.worker_id
    }

    /// Run cycles until `shutdown` resolves
    ///
    /// Shutdown is only observed while polling or idling, never between
    /// persisting a batch and acknowledging it.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        info!(
            region = %self.identity.region_id,
            worker = %self.identity.worker_id,
            "worker loop started"
        );

        loop {
            let entries = tokio::select! {
                _ = &mut shutdown => break,
                entries = self.poll() => entries,
            };

            if entries.is_empty() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.settings.idle_delay) => {}
                }
                continue;
            }

            match self.process(entries).await {
                CycleOutcome::Completed { persisted, acknowledged, ack_failures, faulted } => {
                    info!(persisted, acknowledged, ack_failures, faulted, "batch complete")
                }
                CycleOutcome::Abandoned { probed, faulted } => {
                    warn!(probed, faulted, "batch left pending for redelivery")
                }
                CycleOutcome::NothingProbed { faulted } => {
                    warn!(faulted, "no probe in the batch completed")
                }
            }
        }

        info!(worker = %self.identity.worker_id, "worker loop stopped");
        Ok(())
    }

    /// Stale pending entries first, then new entries with a server-side block
    ///
    /// The stale scan walks the pending list a window at a time, resuming
    /// where the previous poll stopped.
    ///
    /// Read failures degrade to an empty poll so the idle delay applies.
    async fn poll(&self) -> Vec<LogEntry> {
        if let Some(min_idle) = self.settings.reclaim_idle {
            let cursor = self.claim_cursor().clone();
            match self
                .log
                .claim_stale(self.group(), self.consumer(), min_idle, self.settings.read_count, &cursor)
                .await
            {
                Ok(claim) => {
                    *self.claim_cursor() = claim.next_cursor;
                    if !claim.entries.is_empty() {
                        info!(count = claim.entries.len(), "reclaimed stale pending entries");
                        return claim.entries;
                    }
                }
                Err(e) => warn!("Failed to reclaim stale entries: {}", e),
            }
        }

        match self
            .log
            .read_group(
                self.group(),
                self.consumer(),
                self.settings.read_count,
                self.settings.read_block,
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to read from stream: {}", e);
                Vec::new()
            }
        }
    }

    /// Probe, persist and acknowledge one non-empty batch
    async fn process(&self, entries: Vec<LogEntry>) -> CycleOutcome {
        let results = self.probe_all(&entries).await;

        let mut records: Vec<UptimeEventRecord> = Vec::with_capacity(entries.len());
        let mut entry_ids: Vec<String> = Vec::with_capacity(entries.len());
        let mut faulted = 0;

        for (entry, result) in entries.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    debug!(
                        entry_id = %entry.entry_id,
                        website_id = %entry.request.id,
                        status = %outcome.status,
                        "probed"
                    );
                    records.push(outcome.into_record(&entry.request.id, &self.identity.region_id));
                    entry_ids.push(entry.entry_id.clone());
                }
                Err(e) => {
                    faulted += 1;
                    error!(
                        entry_id = %entry.entry_id,
                        website_id = %entry.request.id,
                        "Failed to check website: {:#}",
                        e
                    );
                }
            }
        }

        if records.is_empty() {
            return CycleOutcome::NothingProbed { faulted };
        }

        if let Err(e) = self.sink.insert_batch(&records).await {
            error!(batch_size = records.len(), "Failed to persist uptime batch: {}", e);
            return CycleOutcome::Abandoned { probed: records.len(), faulted };
        }

        let report = self.log.ack_bulk(self.group(), &entry_ids).await;

        CycleOutcome::Completed {
            persisted: records.len(),
            acknowledged: report.acknowledged,
            ack_failures: report.failed.len(),
            faulted,
        }
    }

    /// Probe every entry in its own task and wait for all of them to settle
    ///
    /// Results come back in entry order. A panicking probe is a fault for its
    /// entry only.
    async fn probe_all(&self, entries: &[LogEntry]) -> Vec<Result<ProbeOutcome>> {
        let handles: Vec<_> = entries
            .iter()
            .map(|entry| {
                let prober = Arc::clone(&self.prober);
                let url = entry.request.url.clone();
                tokio::spawn(async move { prober.probe(&url).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(anyhow!("probe task failed: {}", e))))
            .collect()
    }
}
