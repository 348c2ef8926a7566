//! In-process [`CheckLog`] with consumer-group semantics, for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StreamError;
use crate::log::CheckLog;
use crate::types::{
    CLAIM_CURSOR_START, CheckRequest, ConsumerPending, LogEntry, PendingSummary, StaleClaim,
};

#[derive(Debug)]
struct StoredEntry {
    entry_id: String,
    fields: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: BTreeMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<StoredEntry>,
    next_sequence: u64,
    groups: HashMap<String, GroupState>,
    append_calls: Vec<usize>,
    failing_append_call: Option<usize>,
    failing_acks: HashSet<String>,
    read_calls: usize,
}

impl State {
    fn push(&mut self, fields: HashMap<String, String>) -> String {
        self.next_sequence += 1;
        let entry_id = format!("{:013}-0", self.next_sequence);
        self.entries.push(StoredEntry { entry_id: entry_id.clone(), fields });
        entry_id
    }

    fn decode(&self, entry_id: &str) -> Option<LogEntry> {
        let stored = self.entries.iter().find(|e| e.entry_id == entry_id)?;
        let url = stored.fields.get("url").filter(|v| !v.is_empty())?;
        let id = stored.fields.get("id").filter(|v| !v.is_empty())?;
        Some(LogEntry {
            entry_id: stored.entry_id.clone(),
            request: CheckRequest::new(url.clone(), id.clone()),
        })
    }
}

/// Pending entries examined per claimed entry in one stale scan, as Redis
/// does for `XAUTOCLAIM`.
const CLAIM_SCAN_FACTOR: usize = 10;

/// Groups are created on first read at the head of the log. Malformed
/// entries are acknowledged as soon as they are delivered.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<State>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry with arbitrary fields, bypassing [`CheckRequest`].
    pub fn push_raw(&self, fields: &[(&str, &str)]) -> String {
        let fields = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.state().push(fields)
    }

    /// Make the `call`-th append (1-based) fail without writing anything.
    pub fn fail_append_call(&self, call: usize) {
        self.state().failing_append_call = Some(call);
    }

    pub fn fail_ack_for(&self, entry_id: &str) {
        self.state().failing_acks.insert(entry_id.to_string());
    }

    /// Sizes of the successful grouped appends, in order.
    pub fn append_calls(&self) -> Vec<usize> {
        self.state().append_calls.clone()
    }

    pub fn read_calls(&self) -> usize {
        self.state().read_calls
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_ids(&self, group: &str) -> Vec<String> {
        self.state()
            .groups
            .get(group)
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn injected_failure(what: &str) -> StreamError {
    StreamError::Transport(redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        format!("injected {what} failure"),
    )))
}

#[async_trait]
impl CheckLog for MemoryLog {
    async fn append_chunk(&self, chunk: &[CheckRequest]) -> Result<Vec<String>, StreamError> {
        let mut state = self.state();
        let call = state.append_calls.len() + 1;
        if state.failing_append_call == Some(call) {
            return Err(injected_failure("append"));
        }

        let ids = chunk
            .iter()
            .map(|request| {
                state.push(HashMap::from([
                    ("url".to_string(), request.url.clone()),
                    ("id".to_string(), request.id.clone()),
                ]))
            })
            .collect();
        state.append_calls.push(chunk.len());
        Ok(ids)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StreamError> {
        let delivered = {
            let mut state = self.state();
            state.read_calls += 1;
            let total = state.entries.len();
            let group_state = state.groups.entry(group.to_string()).or_default();
            let start = group_state.cursor;
            let end = (start + count).min(total);
            group_state.cursor = end;

            let delivered: Vec<LogEntry> = state.entries[start..end]
                .iter()
                .filter_map(|entry| state.decode(&entry.entry_id))
                .collect();
            let now = Instant::now();
            let group_state = state.groups.entry(group.to_string()).or_default();
            for entry in &delivered {
                group_state.pending.insert(
                    entry.entry_id.clone(),
                    PendingEntry { consumer: consumer.to_string(), delivered_at: now },
                );
            }
            delivered
        };

        if delivered.is_empty() && !block.is_zero() {
            tokio::time::sleep(block).await;
        }
        Ok(delivered)
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
        cursor: &str,
    ) -> Result<StaleClaim, StreamError> {
        let mut state = self.state();
        let now = Instant::now();
        let mut next_cursor = CLAIM_CURSOR_START.to_string();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(StaleClaim { entries: Vec::new(), next_cursor });
        };

        let budget = count.max(1) * CLAIM_SCAN_FACTOR;
        let mut scanned = 0;
        let mut claimed = Vec::new();
        for (id, pending) in group_state.pending.range_mut(cursor.to_string()..) {
            if claimed.len() == count || scanned == budget {
                next_cursor = id.clone();
                break;
            }
            scanned += 1;
            if now.duration_since(pending.delivered_at) >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                claimed.push(id.clone());
            }
        }

        let entries = claimed.iter().filter_map(|id| state.decode(id)).collect();
        Ok(StaleClaim { entries, next_cursor })
    }

    async fn ack(&self, group: &str, entry_id: &str) -> Result<bool, StreamError> {
        let mut state = self.state();
        if state.failing_acks.contains(entry_id) {
            return Err(injected_failure("ack"));
        }
        Ok(state
            .groups
            .get_mut(group)
            .is_some_and(|g| g.pending.remove(entry_id).is_some()))
    }

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, StreamError> {
        let state = self.state();
        let backlog_length = state.entries.len() as u64;
        let Some(group_state) = state.groups.get(group) else {
            return Ok(PendingSummary { backlog_length, ..PendingSummary::default() });
        };

        let mut per_consumer: BTreeMap<&str, u64> = BTreeMap::new();
        for pending in group_state.pending.values() {
            *per_consumer.entry(pending.consumer.as_str()).or_default() += 1;
        }

        Ok(PendingSummary {
            count: group_state.pending.len() as u64,
            backlog_length,
            lowest_id: group_state.pending.keys().next().cloned(),
            highest_id: group_state.pending.keys().next_back().cloned(),
            consumers: per_consumer
                .into_iter()
                .map(|(consumer, pending)| ConsumerPending {
                    consumer: consumer.to_string(),
                    pending,
                })
                .collect(),
        })
    }
}
