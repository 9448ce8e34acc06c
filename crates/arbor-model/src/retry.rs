// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Retry policy for one router target: bounded attempts with exponential
/// backoff.  Only transport-style failures re-issue; see
/// [`crate::ModelError::is_retryable`].
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Total attempts including the first call.
    pub attempts: u32,
    /// Delay before the second attempt; doubles per further attempt.
    pub base_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { attempts: 3, base_delay: Duration::from_secs(1) }
    }
}

impl RetrySettings {
    /// Backoff before re-issuing after `attempt` (1-based) failed:
    /// base, 2×base, 4×base, …
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let r = RetrySettings::default();
        assert_eq!(r.backoff(1), Duration::from_secs(1));
        assert_eq!(r.backoff(2), Duration::from_secs(2));
        assert_eq!(r.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_scales_with_base_delay() {
        let r = RetrySettings { attempts: 3, base_delay: Duration::from_millis(10) };
        assert_eq!(r.backoff(2), Duration::from_millis(20));
    }

    #[test]
    fn large_attempt_does_not_overflow() {
        let r = RetrySettings::default();
        let _ = r.backoff(u32::MAX);
    }
}
