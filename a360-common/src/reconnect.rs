//! Observer reconnect state
//!
//! Live-channel observers reconnect on their own schedule; the channel
//! itself keeps no backlog. Instead of nested timers buried in callbacks,
//! the reconnect behavior is explicit data: a [`ReconnectPolicy`] describing
//! the backoff curve and a [`ReconnectState`] machine that consumers step
//! through on connect/failure, which makes the schedule unit-testable
//! without a network.

use std::time::Duration;

/// Backoff parameters for observer reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Backoff multiplier applied per consecutive failure
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// Connection phase of one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Explicit reconnect state machine
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    phase: ConnectionPhase,
    consecutive_failures: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: ConnectionPhase::Disconnected,
            consecutive_failures: 0,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay to wait before the next connection attempt.
    pub fn next_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let mut delay = self.policy.base_delay;
        for _ in 1..self.consecutive_failures {
            delay = delay
                .saturating_mul(self.policy.multiplier)
                .min(self.policy.max_delay);
        }
        delay.min(self.policy.max_delay)
    }

    /// An attempt is starting.
    pub fn on_connecting(&mut self) {
        self.phase = ConnectionPhase::Connecting;
    }

    /// The channel is up. Failure history resets so the next drop retries
    /// promptly.
    pub fn on_connected(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.consecutive_failures = 0;
    }

    /// The attempt failed or an established connection dropped.
    pub fn on_failure(&mut self) {
        self.phase = ConnectionPhase::Disconnected;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            multiplier: 2,
        }
    }

    #[test]
    fn first_attempt_is_immediate() {
        let state = ReconnectState::new(policy());
        assert_eq!(state.phase(), ConnectionPhase::Disconnected);
        assert_eq!(state.next_delay(), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut state = ReconnectState::new(policy());
        let mut delays = Vec::new();
        for _ in 0..5 {
            state.on_connecting();
            state.on_failure();
            delays.push(state.next_delay());
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn success_resets_the_schedule() {
        let mut state = ReconnectState::new(policy());
        state.on_connecting();
        state.on_failure();
        state.on_connecting();
        state.on_failure();
        assert_eq!(state.consecutive_failures(), 2);

        state.on_connecting();
        state.on_connected();
        assert_eq!(state.phase(), ConnectionPhase::Connected);
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.next_delay(), Duration::ZERO);
    }
}
