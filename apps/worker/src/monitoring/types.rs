use chrono::{DateTime, Utc};
use timeseries::{UptimeEventRecord, UptimeStatus};

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// UP when any response arrived before the deadline
    pub status: UptimeStatus,

    /// Time until the response arrived, only set when UP
    pub response_time_ms: Option<u32>,

    /// When the probe started
    pub checked_at: DateTime<Utc>,
}

impl ProbeOutcome {
    /// A response arrived after `response_time_ms`
    pub fn up(response_time_ms: u32, checked_at: DateTime<Utc>) -> Self {
        Self { status: UptimeStatus::Up, response_time_ms: Some(response_time_ms), checked_at }
    }

    /// No response: timeout, connection or protocol failure
    pub fn down(checked_at: DateTime<Utc>) -> Self {
        Self { status: UptimeStatus::Down, response_time_ms: None, checked_at }
    }

    /// Attach the website and region identity for storage
    pub fn into_record(self, website_id: &str, region_id: &str) -> UptimeEventRecord {
        UptimeEventRecord {
            website_id: website_id.to_string(),
            region_id: region_id.to_string(),
            status: self.status,
            response_time_ms: self.response_time_ms,
            checked_at: self.checked_at,
        }
    }
}
