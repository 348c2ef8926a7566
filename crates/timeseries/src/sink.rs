use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::PersistenceError;
use crate::types::{EventRow, UptimeEventRecord};

static IDENTIFIER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").ok());

/// Transport to the storage engine.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Run a statement that returns no rows.
    async fn command(&self, statement: &str) -> Result<(), PersistenceError>;

    /// Insert `rows` into `table` as one write.
    async fn insert_rows(&self, table: &str, rows: &[EventRow]) -> Result<(), PersistenceError>;
}

/// Reject anything but ASCII letters, digits and underscores before the name
/// is interpolated into a statement.
pub fn validate_identifier(identifier: &str) -> Result<(), PersistenceError> {
    if IDENTIFIER.as_ref().is_some_and(|pattern| pattern.is_match(identifier)) {
        Ok(())
    } else {
        Err(PersistenceError::InvalidIdentifier(identifier.to_string()))
    }
}

fn create_table_statement(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    website_id String,
    region_id String,
    status Enum('UP' = 1, 'DOWN' = 0),
    response_time_ms Nullable(UInt32),
    checked_at DateTime64(3, 'UTC'),
    ingested_at DateTime64(3, 'UTC')
)
ENGINE = MergeTree
ORDER BY (website_id, region_id, checked_at)"
    )
}

type Provisioning = Shared<BoxFuture<'static, Result<(), Arc<PersistenceError>>>>;

enum Schema {
    Unknown,
    InFlight(Provisioning),
    Ready,
}

/// Batched writer for uptime events.
///
/// The table is provisioned lazily on first use. Concurrent callers share
/// one in-flight attempt and all see its result, failure included. Once an
/// attempt has failed the next caller starts a fresh one.
pub struct TimeSeriesSink {
    store: Arc<dyn EventStore>,
    table: String,
    schema: Mutex<Schema>,
}

impl TimeSeriesSink {
    pub fn new(store: Arc<dyn EventStore>, table: impl Into<String>) -> Self {
        Self { store, table: table.into(), schema: Mutex::new(Schema::Unknown) }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn schema(&self) -> MutexGuard<'_, Schema> {
        self.schema.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn provision(&self) -> Provisioning {
        let store = Arc::clone(&self.store);
        let table = self.table.clone();
        async move {
            store.command(&create_table_statement(&table)).await.map_err(Arc::new)?;
            info!(%table, "uptime event table ready");
            Ok::<(), Arc<PersistenceError>>(())
        }
        .boxed()
        .shared()
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        validate_identifier(&self.table)?;

        let attempt = {
            let mut schema = self.schema();
            let in_flight = match &*schema {
                Schema::Ready => return Ok(()),
                Schema::InFlight(attempt) => Some(attempt.clone()),
                Schema::Unknown => None,
            };
            match in_flight {
                Some(attempt) => attempt,
                None => {
                    let attempt = self.provision();
                    *schema = Schema::InFlight(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;

        {
            let mut schema = self.schema();
            // Only the attempt that settled may move the state on
            if let Schema::InFlight(current) = &*schema {
                if current.ptr_eq(&attempt) {
                    *schema = if result.is_ok() { Schema::Ready } else { Schema::Unknown };
                }
            }
        }

        result.map_err(|error| {
            warn!(table = %self.table, %error, "schema provisioning failed");
            PersistenceError::Provisioning(error)
        })
    }

    /// Store `records` as one write. Every row shares the same `ingested_at`.
    ///
    /// On error the outcome of the write is unknown and none of the records
    /// may be treated as stored.
    pub async fn insert_batch(&self, records: &[UptimeEventRecord]) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }

        self.ensure_schema().await?;

        let ingested_at = Utc::now();
        let rows: Vec<EventRow> =
            records.iter().map(|record| EventRow::new(record, ingested_at)).collect();
        self.store.insert_rows(&self.table, &rows).await?;

        debug!(table = %self.table, rows = rows.len(), "inserted uptime events");
        Ok(())
    }

    pub async fn insert_one(&self, record: &UptimeEventRecord) -> Result<(), PersistenceError> {
        self.insert_batch(std::slice::from_ref(record)).await
    }
}
