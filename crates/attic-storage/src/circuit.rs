// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use clap::Args;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Args)]
#[serde(rename_all = "kebab-case", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[clap(long = "storage-failure-threshold", default_value_t = default_threshold())]
    pub failure_threshold: u32,
    /// How long the breaker stays open before a probe is allowed.
    #[clap(long = "storage-open-secs", default_value_t = default_open_secs())]
    pub open_secs: u64,
}

fn default_threshold() -> u32 {
    5
}
fn default_open_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_threshold(),
            open_secs: default_open_secs(),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker for one object-store endpoint.
/// While open, calls short-circuit with a typed error; after the open
/// window a single probe is let through and its outcome decides whether
/// the breaker closes again.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed right now.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } => true,
            State::HalfOpen => false,
            State::Open { since } => {
                if since.elapsed() >= Duration::from_secs(self.config.open_secs) {
                    *state = State::HalfOpen;
                    info!("circuit breaker half-open, probing object store");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if matches!(*state, State::HalfOpen | State::Open { .. }) {
            info!("circuit breaker closed after successful probe");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(failures, "circuit breaker opened for object store endpoint");
                    *state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::HalfOpen => {
                warn!("object store probe failed, circuit breaker re-opened");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            open_secs,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(3, 60);
        assert!(cb.allow());
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.allow());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let cb = breaker(3, 60);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[test]
    fn probe_after_open_window() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.is_open());
        // Open window elapsed (zero seconds): one probe allowed.
        assert!(cb.allow());
        // Only one probe until it resolves.
        assert!(!cb.allow());
        cb.record_success();
        assert!(cb.allow());
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.allow());
        cb.record_failure();
        assert!(cb.is_open());
    }
}
