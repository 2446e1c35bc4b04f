//! Backoff Controller shared by the recognition restart path and the
//! transport reconnect path.
//!
//! `next_delay(failures) = min(max, base * 2^failures)`. Each channel owns its
//! own [`Backoff`]; nothing here is shared between sessions.

use crate::config::BackoffConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Pure delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `consecutive_failures` earlier failures.
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        // 2^31 * base already dwarfs any sane cap
        let exp = consecutive_failures.min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Per-channel failure history: consecutive error count plus a monotonic
/// "suppress restart until" instant.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    consecutive_failures: u32,
    suppress_until: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            suppress_until: None,
        }
    }

    /// Record one transient failure and return how long to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.policy.next_delay(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let until = Instant::now() + delay;
        // never move the suppression window backwards
        self.suppress_until = Some(match self.suppress_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });

        debug!(
            failures = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "backoff: failure recorded"
        );
        delay
    }

    /// Any successful recognition result or connection resets the history.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(failures = self.consecutive_failures, "backoff: reset after success");
        }
        self.consecutive_failures = 0;
        self.suppress_until = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn suppress_until(&self) -> Option<Instant> {
        self.suppress_until
    }

    /// True while a restart is still being held back.
    pub fn is_suppressed(&self, now: Instant) -> bool {
        self.suppress_until.map_or(false, |until| now < until)
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
