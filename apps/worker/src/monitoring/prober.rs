use anyhow::Result;
use chrono::Utc;
use reqwest::redirect::Policy;
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::ProbeOutcome;

/// Probe deadline and redirect budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub max_redirects: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(10_000), max_redirects: 5 }
    }
}

/// Prober trait for checking a target URL
///
/// A DOWN target is a normal `Ok` outcome. `Err` is reserved for faults of
/// the probe itself.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeOutcome>;
}

/// HTTP/HTTPS prober
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(settings: ProbeSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .redirect(Policy::limited(settings.max_redirects))
            .user_agent(concat!("uppe-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Probe for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeOutcome> {
        let checked_at = Utc::now();
        let start = Instant::now();

        // Any status code counts as UP, only the arrival of a response matters
        match self.client.get(url).send().await {
            Ok(response) => {
                let latency = u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX);
                debug!(url, status = response.status().as_u16(), latency, "probe answered");
                Ok(ProbeOutcome::up(latency, checked_at))
            }
            Err(error) => {
                debug!(url, %error, "probe got no response");
                Ok(ProbeOutcome::down(checked_at))
            }
        }
    }
}
