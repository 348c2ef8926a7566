use std::io::Error as IoError;
use std::path::PathBuf;

use streams::StreamError;
use thiserror::Error;
use timeseries::PersistenceError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Check log error: {0}")]
    Stream(#[from] StreamError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Failed to read {}: {source}", path.display())]
    ReadBatch {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("Invalid check batch in {}: {source}", path.display())]
    ParseBatch {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to build the HTTP prober: {0:#}")]
    ProbeSetup(anyhow::Error),
    #[error("{0:#}")]
    Worker(anyhow::Error),
}
