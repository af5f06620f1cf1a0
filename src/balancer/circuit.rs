//! Per-Instance Circuit Breaker
//!
//! ```text
//!   closed ──(threshold consecutive failures)──► open
//!     ▲                                           │ cooldown since last failure
//!     │ success                                   ▼
//!     └──────────────────────────────────────  half_open ──failure──► open
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// A state change worth reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
    times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            threshold: threshold.max(1),
            cooldown,
            times_opened: 0,
        }
    }

    /// Stored state; an open breaker past its cooldown still reads `Open`
    /// until `refresh` is called
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// State as of `now`, applying the cooldown without mutating
    pub fn effective_state(&self, now: Instant) -> CircuitState {
        match self.state {
            CircuitState::Open if self.cooled_down(now) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Whether a request may be sent at `now`
    pub fn allows(&self, now: Instant) -> bool {
        self.effective_state(now) != CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    /// Move `open -> half_open` once the cooldown has elapsed
    pub fn refresh(&mut self, now: Instant) -> Option<Transition> {
        if self.state == CircuitState::Open && self.cooled_down(now) {
            return Some(self.go(CircuitState::HalfOpen));
        }
        None
    }

    pub fn record_success(&mut self, now: Instant) -> Option<Transition> {
        let transition = self.refresh(now);
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::HalfOpen => {
                let closed = self.go(CircuitState::Closed);
                Some(Transition {
                    from: transition.map(|t| t.from).unwrap_or(closed.from),
                    to: closed.to,
                })
            }
            _ => transition,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        let refreshed = self.refresh(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);

        let opened = match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                Some(self.go(CircuitState::Open))
            }
            CircuitState::HalfOpen => Some(self.go(CircuitState::Open)),
            _ => None,
        };

        match (refreshed, opened) {
            (Some(first), Some(second)) if first.from == second.to => None,
            (Some(first), Some(second)) => Some(Transition {
                from: first.from,
                to: second.to,
            }),
            (first, second) => second.or(first),
        }
    }

    /// Force the breaker closed (operator reset)
    pub fn reset(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        (self.state != CircuitState::Closed).then(|| self.go(CircuitState::Closed))
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.last_failure_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.cooldown)
    }

    fn go(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        if to == CircuitState::Open {
            self.times_opened += 1;
        }
        Transition { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, COOLDOWN);
        let now = Instant::now();
        assert_eq!(breaker.record_failure(now), None);
        assert_eq!(breaker.record_failure(now), None);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let t = breaker.record_failure(now).unwrap();
        assert_eq!((t.from, t.to), (CircuitState::Closed, CircuitState::Open));
        assert!(!breaker.allows(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::new(3, COOLDOWN);
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success(now);
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        let opened_at = Instant::now();
        breaker.record_failure(opened_at);

        let almost = opened_at + COOLDOWN - Duration::from_millis(1);
        assert_eq!(breaker.effective_state(almost), CircuitState::Open);
        assert_eq!(breaker.refresh(almost), None);

        let t = breaker.refresh(opened_at + COOLDOWN).unwrap();
        assert_eq!(t.to, CircuitState::HalfOpen);
        assert!(breaker.allows(opened_at + COOLDOWN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_outcomes() {
        let start = Instant::now();
        let later = start + COOLDOWN;

        let mut recovered = CircuitBreaker::new(1, COOLDOWN);
        recovered.record_failure(start);
        let t = recovered.record_success(later).unwrap();
        assert_eq!((t.from, t.to), (CircuitState::Open, CircuitState::Closed));

        let mut relapsed = CircuitBreaker::new(1, COOLDOWN);
        relapsed.record_failure(start);
        relapsed.refresh(later);
        let t = relapsed.record_failure(later).unwrap();
        assert_eq!((t.from, t.to), (CircuitState::HalfOpen, CircuitState::Open));
        assert_eq!(relapsed.times_opened(), 2);
        assert!(!relapsed.allows(later + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_open_extends_cooldown() {
        let mut breaker = CircuitBreaker::new(1, COOLDOWN);
        let start = Instant::now();
        breaker.record_failure(start);
        breaker.record_failure(start + Duration::from_secs(20));
        assert!(!breaker.allows(start + COOLDOWN));
        assert!(breaker.allows(start + Duration::from_secs(50)));
    }
}
