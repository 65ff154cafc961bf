//! Readiness probing for a freshly launched preview server.
//!
//! The preview process starts in the background, so its port is not
//! listening yet when the deploy returns. The probe polls the public address
//! with exponential backoff until the sandbox router stops answering 5xx.

use crate::config::ReadinessConfig;
use std::time::Duration;

/// Outcome of [`ReadinessProbe::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

#[derive(Clone)]
pub struct ReadinessProbe {
    http: reqwest::Client,
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ReadinessProbe {
    pub fn new(config: &ReadinessConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build readiness HTTP client: {e}"))?;

        Ok(Self {
            http,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        })
    }

    /// Delay slept before attempt `attempt` (zero-based): doubles from the
    /// initial delay, capped at the max delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Poll `url` until it answers with a non-5xx status or attempts run out.
    pub async fn wait(&self, url: &str) -> Readiness {
        for attempt in 0..self.max_attempts {
            tokio::time::sleep(self.delay_for(attempt)).await;

            match self.http.get(url).send().await {
                Ok(resp) if !resp.status().is_server_error() => {
                    tracing::debug!(url, attempt, status = %resp.status(), "Preview is ready");
                    return Readiness::Ready {
                        attempts: attempt + 1,
                    };
                }
                Ok(resp) => {
                    tracing::debug!(url, attempt, status = %resp.status(), "Preview not ready yet");
                }
                Err(e) => {
                    tracing::debug!(url, attempt, "Preview probe failed: {e}");
                }
            }
        }

        tracing::warn!(url, attempts = self.max_attempts, "Preview did not become ready");
        Readiness::TimedOut {
            attempts: self.max_attempts,
        }
    }
}
