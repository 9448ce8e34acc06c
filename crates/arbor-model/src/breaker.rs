// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Count-based circuit breaker.
//!
//! Outcomes of the last `window` calls are kept in a sliding window.  Once
//! the window is full, the breaker opens when the failure ratio reaches
//! `failure_ratio` or when the slow-call ratio reaches `slow_ratio` (a call
//! slower than `slow_call` counts against the slow budget even when it
//! succeeds).  An open breaker rejects calls for `open_for`, then admits
//! `half_open_probes` probe calls: one probe failure re-opens, all probes
//! succeeding closes and clears the window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub window: usize,
    pub failure_ratio: f64,
    pub slow_ratio: f64,
    pub slow_call: Duration,
    pub open_for: Duration,
    pub half_open_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window: 10,
            failure_ratio: 0.5,
            slow_ratio: 0.8,
            slow_call: Duration::from_secs(60),
            open_for: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { probes_issued: u32, probe_successes: u32 },
}

struct Inner {
    state: State,
    window: VecDeque<Outcome>,
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner { state: State::Closed, window: VecDeque::new() }),
        }
    }

    /// Whether a call may proceed right now.  An open breaker that has
    /// cooled down transitions to half-open and admits the caller as the
    /// first probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => true,
            State::Open { since } => {
                if since.elapsed() >= self.settings.open_for {
                    inner.state = State::HalfOpen { probes_issued: 1, probe_successes: 0 };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { ref mut probes_issued, .. } => {
                if *probes_issued < self.settings.half_open_probes {
                    *probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.record(Outcome { failed: false, slow: elapsed >= self.settings.slow_call });
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.record(Outcome { failed: true, slow: elapsed >= self.settings.slow_call });
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, State::Open { .. })
    }

    fn record(&self, outcome: Outcome) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.window.push_back(outcome);
                while inner.window.len() > self.settings.window {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.settings.window && self.should_trip(&inner.window) {
                    warn!("circuit breaker tripped");
                    inner.window.clear();
                    inner.state = State::Open { since: Instant::now() };
                }
            }
            State::HalfOpen { probe_successes, .. } => {
                if outcome.failed {
                    // One failed probe is enough evidence the backend is
                    // still unhealthy.
                    inner.state = State::Open { since: Instant::now() };
                } else {
                    let successes = probe_successes + 1;
                    if successes >= self.settings.half_open_probes {
                        inner.window.clear();
                        inner.state = State::Closed;
                    } else if let State::HalfOpen { ref mut probe_successes, .. } = inner.state {
                        *probe_successes = successes;
                    }
                }
            }
            // A straggler finishing after the breaker opened; its outcome is
            // already priced in.
            State::Open { .. } => {}
        }
    }

    fn should_trip(&self, window: &VecDeque<Outcome>) -> bool {
        let total = window.len() as f64;
        let failed = window.iter().filter(|o| o.failed).count() as f64;
        let slow = window.iter().filter(|o| o.slow).count() as f64;
        failed / total >= self.settings.failure_ratio || slow / total >= self.settings.slow_ratio
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
