// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a failed operation should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying: network hiccups, timeouts, deadlocks, slow-downs.
    Transient,
    /// Retrying cannot help: bad credentials, missing table, corrupt data.
    Permanent,
}

/// A single retry policy shared by the object-store client, the database
/// adapter, and the lock manager. Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_base_secs")]
    pub base_secs: f64,
    #[serde(default = "RetryPolicy::default_cap_secs")]
    pub cap_secs: f64,
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
}

impl RetryPolicy {
    fn default_base_secs() -> f64 {
        2.0
    }
    fn default_cap_secs() -> f64 {
        30.0
    }
    fn default_max_attempts() -> u32 {
        3
    }

    /// Delay before attempt `attempt` (1-based), with full jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_secs * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cap_secs);
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_secs_f64(jittered)
    }

    /// An unbounded backoff for operations that must eventually succeed
    /// (watermark writes, manifest updates), matching the defaults the
    /// storage helpers use.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_secs_f64(self.base_secs),
            max_interval: Duration::from_secs_f64(self.cap_secs),
            ..ExponentialBackoff::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: Self::default_base_secs(),
            cap_secs: Self::default_cap_secs(),
            max_attempts: Self::default_max_attempts(),
        }
    }
}

/// Retries `op` per `policy`, consulting `classify` after each failure.
/// Permanent errors and retry exhaustion return the last error.
pub async fn retry_classified<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if classify(&e) == ErrorClass::Permanent || attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
