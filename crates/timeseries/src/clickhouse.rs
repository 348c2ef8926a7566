use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;
use url::Url;

use crate::error::PersistenceError;
use crate::sink::{EventStore, validate_identifier};
use crate::types::EventRow;

/// Connection settings for the ClickHouse HTTP interface.
#[derive(Clone, PartialEq, Eq)]
pub struct ClickHouseSettings {
    pub url: String,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
    pub table: String,
}

impl fmt::Debug for ClickHouseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("table", &self.table)
            .finish()
    }
}

/// Upper bound for a whole statement, response body included.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// [`EventStore`] over ClickHouse's HTTP interface.
///
/// Statements are sent as POST bodies; inserts use `JSONEachRow`.
pub struct ClickHouseHttp {
    client: Client,
    endpoint: Url,
    username: String,
    password: Option<String>,
    database: String,
}

impl ClickHouseHttp {
    pub fn new(settings: &ClickHouseSettings) -> Result<Self, PersistenceError> {
        Self::with_request_timeout(settings, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(
        settings: &ClickHouseSettings,
        request_timeout: Duration,
    ) -> Result<Self, PersistenceError> {
        let endpoint = Url::parse(&settings.url)
            .map_err(|error| PersistenceError::InvalidEndpoint(format!("{}: {error}", settings.url)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(PersistenceError::InvalidEndpoint(settings.url.clone()));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .user_agent(concat!("uppe-timeseries/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            username: settings.username.clone(),
            password: settings.password.clone(),
            database: settings.database.clone(),
        })
    }

    fn url_with(&self, params: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("database", &self.database);
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        url
    }

    async fn post(&self, url: Url, body: String) -> Result<(), PersistenceError> {
        let mut request = self
            .client
            .post(url)
            .header("X-ClickHouse-User", &self.username)
            .body(body);
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<(), PersistenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(PersistenceError::Rejected { status: status.as_u16(), body: body.trim().to_string() })
}

/// Newline-delimited JSON body for a `FORMAT JSONEachRow` insert.
fn json_each_row(rows: &[EventRow]) -> Result<String, PersistenceError> {
    let mut body = String::new();
    for row in rows {
        body.push_str(&serde_json::to_string(row)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl EventStore for ClickHouseHttp {
    async fn command(&self, statement: &str) -> Result<(), PersistenceError> {
        let url = self.url_with(&[("wait_end_of_query", "1")]);
        self.post(url, statement.to_string()).await
    }

    async fn insert_rows(&self, table: &str, rows: &[EventRow]) -> Result<(), PersistenceError> {
        validate_identifier(table)?;
        let query = format!("INSERT INTO {table} FORMAT JSONEachRow");
        let url = self.url_with(&[("query", query.as_str())]);

        debug!(table, rows = rows.len(), "sending insert to clickhouse");
        self.post(url, json_each_row(rows)?).await
    }
}
