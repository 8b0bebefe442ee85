//! Resource waiting with exponential backoff.
//!
//! Provides a generic abstraction for waiting on cloud resources (or any
//! async condition) to reach a desired state, with configurable exponential
//! backoff, jitter, and a hard timeout ceiling. Every blocking wait in this
//! crate goes through here so nothing can hang forever.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for resource waiting with exponential backoff.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Initial delay between checks
    pub initial_delay: Duration,
    /// Maximum delay between checks (cap for exponential growth)
    pub max_delay: Duration,
    /// Maximum total time to wait before timeout
    pub timeout: Duration,
    /// Jitter factor (0.0 - 1.0) to add randomness to delays
    pub jitter: f64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
            timeout: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

impl WaitConfig {
    /// Create a new WaitConfig with the given timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Wait for a resource to reach a desired state.
///
/// `check` returns `Ok(true)` when the resource is ready, `Ok(false)` to keep
/// waiting. A check error aborts the wait immediately; exceeding the
/// configured timeout is an error, never an infinite hang.
pub async fn wait_for_resource<F, Fut>(
    config: WaitConfig,
    check: F,
    resource_name: &str,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = std::time::Instant::now();
    let mut delay = config.initial_delay;
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        if start.elapsed() >= config.timeout {
            anyhow::bail!(
                "Timeout waiting for {} after {:?} ({} attempts)",
                resource_name,
                config.timeout,
                attempts
            );
        }

        match check().await {
            Ok(true) => {
                debug!(resource = %resource_name, attempts, "Resource ready");
                return Ok(());
            }
            Ok(false) => {
                let jittered = jittered_delay(delay, config.jitter);
                debug!(
                    resource = %resource_name,
                    attempt = attempts,
                    delay_ms = jittered.as_millis(),
                    "Resource not ready, retrying"
                );

                tokio::time::sleep(jittered).await;

                // Exponential backoff
                delay = (delay * 2).min(config.max_delay);
            }
            Err(e) => {
                warn!(resource = %resource_name, error = ?e, "Resource check failed");
                return Err(e);
            }
        }
    }
}

/// Add jitter to a duration to prevent thundering herd.
fn jittered_delay(base: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0.0..jitter_factor);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
}
