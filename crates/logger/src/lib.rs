//! Shared tracing setup for the uppe binaries.

mod subscriber;

pub use subscriber::{LogFormat, init, init_with_level};
