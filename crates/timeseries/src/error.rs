use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("invalid table identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid clickhouse endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("clickhouse transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("clickhouse rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Shared by every caller that waited on the same provisioning attempt.
    #[error("schema provisioning failed: {0}")]
    Provisioning(#[source] Arc<PersistenceError>),

    #[error("failed to encode row: {0}")]
    Encode(#[from] serde_json::Error),
}
