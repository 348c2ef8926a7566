/// Probing module - turns a check request into an outcome
///
/// This module is responsible for:
/// - Issuing bounded-time HTTP checks
/// - Classifying the result as UP or DOWN
pub mod prober;
pub mod types;

pub use prober::{HttpProber, Probe, ProbeSettings};
pub use types::ProbeOutcome;
