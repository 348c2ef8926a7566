//! Append-only storage of uptime check results.
//!
//! [`TimeSeriesSink`] owns the table lifecycle (validated name, one-time
//! schema provisioning) and batching; an [`EventStore`] moves statements and
//! rows to the database. [`ClickHouseHttp`] is the production store.

pub mod clickhouse;
pub mod error;
pub mod sink;
pub mod types;

pub use clickhouse::{ClickHouseHttp, ClickHouseSettings};
pub use error::PersistenceError;
pub use sink::{EventStore, TimeSeriesSink, validate_identifier};
pub use types::{EventRow, UptimeEventRecord, UptimeStatus};
