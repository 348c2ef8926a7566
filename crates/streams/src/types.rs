use serde::{Deserialize, Serialize};

/// A unit of work appended to the log. `id` names the monitored website,
/// never the log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub url: String,
    pub id: String,
}

impl CheckRequest {
    pub fn new(url: impl Into<String>, id: impl Into<String>) -> Self {
        Self { url: url.into(), id: id.into() }
    }
}

/// A delivered log entry. `entry_id` is assigned by the log and is the only
/// token valid for acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub entry_id: String,
    pub request: CheckRequest,
}

/// Cursor that starts a stale-entry scan at the head of the pending list.
pub const CLAIM_CURSOR_START: &str = "0-0";

/// One step of a stale-entry scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleClaim {
    pub entries: Vec<LogEntry>,
    /// Where the next scan continues. [`CLAIM_CURSOR_START`] once the whole
    /// pending list has been covered.
    pub next_cursor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerPending {
    pub consumer: String,
    pub pending: u64,
}

/// Read-only view of a consumer group's unacknowledged entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    /// Delivered but unacknowledged entries in the group.
    pub count: u64,
    /// Total entries currently held by the stream.
    pub backlog_length: u64,
    pub lowest_id: Option<String>,
    pub highest_id: Option<String>,
    pub consumers: Vec<ConsumerPending>,
}
