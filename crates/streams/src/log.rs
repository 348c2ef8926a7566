use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::types::{CheckRequest, LogEntry, PendingSummary, StaleClaim};

/// Number of requests written per grouped append.
pub const DEFAULT_APPEND_CHUNK_SIZE: usize = 250;

/// Outcome of a bulk acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckReport {
    /// Ids the log confirmed as newly acknowledged.
    pub acknowledged: usize,
    /// Ids that were unknown or already acknowledged.
    pub ignored: usize,
    /// Ids whose acknowledgment failed; they stay pending.
    pub failed: Vec<String>,
}

/// Operations over the append-only check log.
#[async_trait]
pub trait CheckLog: Send + Sync {
    /// Write one bounded chunk as a single grouped write and return the
    /// assigned entry ids.
    async fn append_chunk(&self, chunk: &[CheckRequest]) -> Result<Vec<String>, StreamError>;

    /// Read at most `count` never-delivered entries as `consumer` of `group`,
    /// blocking server-side for up to `block`. A zero `block` returns at once.
    /// An empty result is a timeout, not an error. Entries without a `url` or
    /// `id` are acknowledged and dropped.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StreamError>;

    /// Take over entries that have been pending in `group` for at least
    /// `min_idle`, delivering them to `consumer`.
    ///
    /// One call scans a bounded window of the pending list starting at
    /// `cursor`; pass the returned `next_cursor` to the following call to
    /// walk the whole list.
    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
        cursor: &str,
    ) -> Result<StaleClaim, StreamError>;

    /// Acknowledge a single entry. Returns `false` when the id was unknown
    /// or already acknowledged.
    async fn ack(&self, group: &str, entry_id: &str) -> Result<bool, StreamError>;

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, StreamError>;

    /// Append `batch` in chunks of `chunk_size`, one grouped write per chunk.
    ///
    /// Chunks written before a failure stay committed; the error reports how
    /// many entries made it.
    async fn append(
        &self,
        batch: &[CheckRequest],
        chunk_size: usize,
    ) -> Result<Vec<String>, StreamError> {
        let chunk_size = chunk_size.max(1);
        let mut entry_ids = Vec::with_capacity(batch.len());

        for (index, chunk) in batch.chunks(chunk_size).enumerate() {
            match self.append_chunk(chunk).await {
                Ok(ids) => {
                    debug!(chunk = index, size = chunk.len(), "appended check chunk");
                    entry_ids.extend(ids);
                }
                Err(error) => {
                    warn!(
                        chunk = index,
                        committed = entry_ids.len(),
                        %error,
                        "append interrupted"
                    );
                    return Err(StreamError::AppendInterrupted {
                        committed: entry_ids.len(),
                        source: Box::new(error),
                    });
                }
            }
        }

        info!(appended = entry_ids.len(), "appended check requests");
        Ok(entry_ids)
    }

    /// Acknowledge every id independently. A failure for one id is logged
    /// and never affects the others.
    async fn ack_bulk(&self, group: &str, entry_ids: &[String]) -> AckReport {
        let results = join_all(entry_ids.iter().map(|id| self.ack(group, id))).await;

        let mut report = AckReport::default();
        for (entry_id, result) in entry_ids.iter().zip(results) {
            match result {
                Ok(true) => report.acknowledged += 1,
                Ok(false) => {
                    debug!(%entry_id, group, "ack ignored for unknown entry");
                    report.ignored += 1;
                }
                Err(error) => {
                    warn!(%entry_id, group, %error, "failed to acknowledge entry");
                    report.failed.push(entry_id.clone());
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLog;

    fn requests(count: usize) -> Vec<CheckRequest> {
        (0..count)
            .map(|i| CheckRequest::new(format!("https://site-{i}.example"), format!("site-{i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_append_is_split_into_bounded_chunks() {
        let log = MemoryLog::new();

        let ids = log.append(&requests(600), 250).await.unwrap();

        assert_eq!(ids.len(), 600);
        assert_eq!(log.append_calls(), vec![250, 250, 100]);
        assert_eq!(log.len(), 600);
    }

    #[tokio::test]
    async fn test_committed_chunks_survive_a_later_failure() {
        let log = MemoryLog::new();
        log.fail_append_call(3);

        let error = log.append(&requests(600), 250).await.unwrap_err();

        match error {
            StreamError::AppendInterrupted { committed, .. } => assert_eq!(committed, 500),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(log.append_calls(), vec![250, 250]);
        assert_eq!(log.len(), 500);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_still_makes_progress() {
        let log = MemoryLog::new();

        log.append(&requests(3), 0).await.unwrap();

        assert_eq!(log.append_calls(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_bulk_ack_skips_unknown_ids() {
        let log = MemoryLog::new();
        log.append(&requests(2), 250).await.unwrap();
        let entries = log.read_group("eu", "w1", 10, Duration::ZERO).await.unwrap();
        let ids = vec![
            entries[0].entry_id.clone(),
            "999999-0".to_string(),
            entries[1].entry_id.clone(),
        ];

        let report = log.ack_bulk("eu", &ids).await;

        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.ignored, 1);
        assert!(report.failed.is_empty());
        assert_eq!(log.pending_summary("eu").await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_failed_ack_does_not_block_siblings() {
        let log = MemoryLog::new();
        log.append(&requests(3), 250).await.unwrap();
        let entries = log.read_group("eu", "w1", 10, Duration::ZERO).await.unwrap();
        let ids: Vec<String> = entries.iter().map(|e| e.entry_id.clone()).collect();
        log.fail_ack_for(&ids[1]);

        let report = log.ack_bulk("eu", &ids).await;

        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.failed, vec![ids[1].clone()]);
        assert_eq!(log.pending_ids("eu"), vec![ids[1].clone()]);
    }
}
