//! Per-backend circuit breaker.
//!
//! Health sweeps run every few tens of seconds; between sweeps a dead
//! backend would make every call wait out the full operation timeout.  The
//! gateway reports each call outcome to the manager, which keeps one
//! [`CircuitBreaker`] per backend:
//!
//! * `Closed`: calls flow.  Consecutive connection failures are counted.
//! * `Open`: after `failure_threshold` consecutive failures.  The backend is
//!   treated as unhealthy by the router until `recovery_timeout` elapses.
//! * `HalfOpen`: calls flow again.  The next success closes the breaker,
//!   the next failure re-opens it.
//!
//! The breaker is a plain state machine; the caller supplies the clock.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a call may be attempted at `now`.  An open breaker whose
    /// recovery timeout has passed admits calls even before
    /// [`poll`](Self::poll) moves it to half-open.
    pub fn allows(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.recovery_due(now),
        }
    }

    /// Move an expired open breaker to half-open.  Returns the new state if
    /// it changed.
    pub fn poll(&mut self, now: Instant) -> Option<CircuitState> {
        if self.state == CircuitState::Open && self.recovery_due(now) {
            self.state = CircuitState::HalfOpen;
            return Some(self.state);
        }
        None
    }

    /// Record a successful call.  Returns the new state if it changed.
    pub fn on_success(&mut self) -> Option<CircuitState> {
        self.consecutive_failures = 0;
        self.opened_at = None;
        if self.state == CircuitState::Closed {
            return None;
        }
        self.state = CircuitState::Closed;
        Some(self.state)
    }

    /// Record a failed call.  Returns the new state if it changed.
    pub fn on_failure(&mut self, now: Instant) -> Option<CircuitState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if self.state == CircuitState::Open || trip {
            self.opened_at = Some(now);
        }
        if trip {
            self.state = CircuitState::Open;
            return Some(self.state);
        }
        None
    }

    fn recovery_due(&self, now: Instant) -> bool {
        self.opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= self.recovery_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECOVERY: Duration = Duration::from_secs(30);

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, RECOVERY);

        assert_eq!(breaker.on_failure(now), None);
        assert_eq!(breaker.on_failure(now), None);
        assert!(breaker.allows(now));
        assert_eq!(breaker.on_failure(now), Some(CircuitState::Open));
        assert!(!breaker.allows(now));
    }

    #[test]
    fn success_resets_the_count() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, RECOVERY);
        breaker.on_failure(now);
        breaker.on_failure(now);
        assert_eq!(breaker.on_success(), None);
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.on_failure(now);
        breaker.on_failure(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let opened = Instant::now();
        let mut breaker = CircuitBreaker::new(1, RECOVERY);
        breaker.on_failure(opened);

        let early = opened + Duration::from_secs(10);
        assert!(!breaker.allows(early));
        assert_eq!(breaker.poll(early), None);

        let later = opened + RECOVERY;
        assert!(breaker.allows(later));
        assert_eq!(breaker.poll(later), Some(CircuitState::HalfOpen));
        assert_eq!(breaker.poll(later), None);
    }

    #[test]
    fn half_open_trial_decides() {
        let opened = Instant::now();
        let later = opened + RECOVERY;

        let mut recovered = CircuitBreaker::new(3, RECOVERY);
        for _ in 0..3 {
            recovered.on_failure(opened);
        }
        recovered.poll(later);
        assert_eq!(recovered.on_success(), Some(CircuitState::Closed));

        let mut relapsed = CircuitBreaker::new(3, RECOVERY);
        for _ in 0..3 {
            relapsed.on_failure(opened);
        }
        relapsed.poll(later);
        // One failure is enough while half-open, and the timer restarts.
        assert_eq!(relapsed.on_failure(later), Some(CircuitState::Open));
        assert!(!relapsed.allows(later + Duration::from_secs(1)));
    }
}
