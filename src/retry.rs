//! Reconnect backoff and timeout utilities.
//!
//! Reconnection uses linear backoff: attempt `n` waits `base_delay × n`. The
//! counter resets after every successful open, so an unrelated failure later
//! starts again from the shortest delay.

use std::future::Future;
use std::time::Duration;

/// Policy controlling automatic reconnect attempts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Number of consecutive failed attempts after which reconnection stops.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Computes the delay before the given reconnect attempt.
    ///
    /// `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: crate::config::TransportDefaults::RECONNECT_BASE_DELAY,
            max_attempts: crate::config::TransportDefaults::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Reconnect counter owned by one realtime channel.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconnectState {
    attempts: u32,
    enabled: bool,
}

/// A reconnect attempt that should be scheduled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScheduledAttempt {
    /// 1-based attempt number since the last successful open.
    pub attempt: u32,
    pub delay: Duration,
}

impl ReconnectState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Records a successful open.
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// Records an unexpected close and returns the next attempt to schedule.
    ///
    /// `None` when reconnection is disabled or the policy's attempt cap has
    /// been reached.
    pub fn on_close(&mut self, policy: &ReconnectPolicy) -> Option<ScheduledAttempt> {
        if !self.enabled || self.attempts >= policy.max_attempts {
            return None;
        }

        self.attempts += 1;
        Some(ScheduledAttempt {
            attempt: self.attempts,
            delay: policy.delay_for_attempt(self.attempts),
        })
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, ReconnectPolicy, ReconnectState, ScheduledAttempt};

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_attempts: 5,
        }
    }

    fn enabled_state() -> ReconnectState {
        let mut state = ReconnectState::default();
        state.enable();
        state
    }

    #[test]
    fn delays_grow_linearly() {
        let policy = policy();
        let mut state = enabled_state();

        let delays: Vec<Duration> = (0..3)
            .filter_map(|_| state.on_close(&policy))
            .map(|scheduled| scheduled.delay)
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn successful_open_restarts_backoff() {
        let policy = policy();
        let mut state = enabled_state();
        for _ in 0..3 {
            state.on_close(&policy);
        }

        state.on_open();

        assert_eq!(
            state.on_close(&policy),
            Some(ScheduledAttempt {
                attempt: 1,
                delay: Duration::from_millis(100),
            })
        );
    }

    #[test]
    fn stops_at_attempt_cap() {
        let policy = policy();
        let mut state = enabled_state();

        let scheduled = std::iter::from_fn(|| state.on_close(&policy)).count();

        assert_eq!(scheduled, 5);
        assert_eq!(state.attempts(), 5);
        assert!(state.on_close(&policy).is_none());
    }

    #[test]
    fn disabled_state_never_schedules() {
        let policy = policy();
        let mut state = ReconnectState::default();
        assert!(state.on_close(&policy).is_none());

        state.enable();
        state.disable();
        assert!(state.on_close(&policy).is_none());
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn timeout_elapses_for_stalled_future() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let result = with_timeout(
                Duration::from_millis(5),
                std::future::pending::<()>(),
            )
            .await;
            assert!(result.is_err());

            let value = with_timeout(Duration::from_millis(50), async { 7 })
                .await
                .expect("ready future");
            assert_eq!(value, 7);
        });
    }
}
