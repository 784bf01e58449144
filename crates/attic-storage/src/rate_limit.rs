// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use clap::Args;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Args)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    /// Sustained object-store request rate per endpoint.
    #[clap(long = "storage-requests-per-second", default_value_t = default_rps())]
    pub requests_per_second: f64,
    /// Burst capacity of the token bucket.
    #[clap(long = "storage-burst", default_value_t = default_burst())]
    pub burst: f64,
    /// How long the halved refill rate stays in force after a slow-down
    /// response before recovery starts.
    #[clap(long = "storage-slowdown-cooldown-secs", default_value_t = default_cooldown())]
    pub slowdown_cooldown_secs: u64,
}

fn default_rps() -> f64 {
    50.0
}
fn default_burst() -> f64 {
    100.0
}
fn default_cooldown() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            burst: default_burst(),
            slowdown_cooldown_secs: default_cooldown(),
        }
    }
}

struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
    slowdown_until: Option<Instant>,
}

/// Token bucket limiting request rate against one endpoint. A slow-down
/// response halves the refill rate for a cool-down window; once the
/// window passes the rate climbs back toward the configured baseline by
/// 20% per refill.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: config.burst,
                rate: config.requests_per_second,
                last_refill: Instant::now(),
                slowdown_until: None,
            }),
            config,
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * state.rate).min(self.config.burst);

        if let Some(until) = state.slowdown_until {
            if now >= until {
                state.rate =
                    (state.rate * 1.2).min(self.config.requests_per_second);
                if (state.rate - self.config.requests_per_second).abs() < f64::EPSILON {
                    state.slowdown_until = None;
                }
            }
        }
    }

    /// Blocks until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate.max(0.001))
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Reacts to an explicit slow-down response from the store.
    pub fn on_slowdown(&self) {
        let mut state = self.state.lock();
        state.rate = (state.rate / 2.0).max(0.5);
        state.slowdown_until =
            Some(Instant::now() + Duration::from_secs(self.config.slowdown_cooldown_secs));
        warn!(rate = state.rate, "object store requested slow-down, halving request rate");
    }

    pub fn current_rate(&self) -> f64 {
        self.state.lock().rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_second: rps,
            burst,
            slowdown_cooldown_secs: 0,
        })
    }

    #[tokio::test]
    async fn burst_is_granted_without_waiting() {
        let limiter = limiter(1.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn slowdown_halves_the_rate() {
        let limiter = limiter(40.0, 10.0);
        limiter.on_slowdown();
        assert_eq!(limiter.current_rate(), 20.0);
        limiter.on_slowdown();
        assert_eq!(limiter.current_rate(), 10.0);
    }

    #[tokio::test]
    async fn rate_recovers_after_cooldown() {
        let limiter = limiter(40.0, 10.0);
        limiter.on_slowdown();
        assert_eq!(limiter.current_rate(), 20.0);
        // Cooldown of zero: the next acquisitions climb back toward base.
        for _ in 0..20 {
            limiter.acquire().await;
        }
        assert!(limiter.current_rate() > 20.0);
    }
}
