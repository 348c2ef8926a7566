use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire format for `DateTime64(3, 'UTC')` columns.
const CLICKHOUSE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Outcome class of a check. `Up` only means a response arrived in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UptimeStatus {
    Up,
    Down,
}

impl fmt::Display for UptimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UptimeStatus::Up => write!(f, "UP"),
            UptimeStatus::Down => write!(f, "DOWN"),
        }
    }
}

/// One check of one website from one region. Never updated once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UptimeEventRecord {
    pub website_id: String,
    pub region_id: String,
    pub status: UptimeStatus,
    pub response_time_ms: Option<u32>,
    pub checked_at: DateTime<Utc>,
}

/// A record as written to the table, stamped with its ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub website_id: String,
    pub region_id: String,
    pub status: UptimeStatus,
    pub response_time_ms: Option<u32>,
    pub checked_at: String,
    pub ingested_at: String,
}

impl EventRow {
    pub fn new(record: &UptimeEventRecord, ingested_at: DateTime<Utc>) -> Self {
        Self {
            website_id: record.website_id.clone(),
            region_id: record.region_id.clone(),
            status: record.status,
            response_time_ms: record.response_time_ms,
            checked_at: format_timestamp(record.checked_at),
            ingested_at: format_timestamp(ingested_at),
        }
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(CLICKHOUSE_DATETIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_rows_serialize_as_json_each_row() {
        let checked_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 5).unwrap()
            + chrono::Duration::milliseconds(42);
        let record = UptimeEventRecord {
            website_id: "site-1".to_string(),
            region_id: "eu-west".to_string(),
            status: UptimeStatus::Down,
            response_time_ms: None,
            checked_at,
        };

        let row = EventRow::new(&record, checked_at + chrono::Duration::seconds(1));
        let json: serde_json::Value = serde_json::to_value(&row).unwrap();

        assert_eq!(json["status"], "DOWN");
        assert_eq!(json["response_time_ms"], serde_json::Value::Null);
        assert_eq!(json["checked_at"], "2025-03-01 12:30:05.042");
        assert_eq!(json["ingested_at"], "2025-03-01 12:30:06.042");
    }
}
