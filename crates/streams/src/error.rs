use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("redis transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("invalid redis endpoint: {0}")]
    InvalidEndpoint(String),

    /// MULTI/EXEC returned nil, nothing from the chunk was written.
    #[error("grouped append was discarded by the server")]
    AppendDiscarded,

    #[error("append interrupted after {committed} committed entries: {source}")]
    AppendInterrupted {
        committed: usize,
        #[source]
        source: Box<StreamError>,
    },
}
