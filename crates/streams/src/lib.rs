//! Check log over an append-only, consumer-grouped stream.
//!
//! The [`CheckLog`] trait is the seam the worker and the enqueuer talk to.
//! [`RedisLog`] implements it over Redis Streams; entries carry exactly the
//! `url` and `id` fields of a [`CheckRequest`].

pub mod error;
pub mod log;
pub mod redis_log;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use error::StreamError;
pub use log::{AckReport, CheckLog, DEFAULT_APPEND_CHUNK_SIZE};
pub use redis_log::{RedisLog, RedisSettings};
pub use types::{
    CLAIM_CURSOR_START, CheckRequest, ConsumerPending, LogEntry, PendingSummary, StaleClaim,
};
