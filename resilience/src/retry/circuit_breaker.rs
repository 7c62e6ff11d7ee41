//! Circuit breaker over a sliding failure window
//!
//! One breaker per error kind. Too many failures inside the window open the
//! circuit and automatic retries for that kind stop; after a full window
//! the breaker lets the next attempt through (half-open) and closes on a
//! success.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    window: Duration,
    threshold: u32,
    failures: VecDeque<Instant>,
    state: CircuitState,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            failures: VecDeque::new(),
            state: CircuitState::Closed,
            open_until: None,
        }
    }

    pub fn state(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open
            && let Some(until) = self.open_until
            && now >= until
        {
            self.state = CircuitState::HalfOpen;
            self.open_until = None;
        }
        self.state
    }

    pub fn allows_retry(&mut self, now: Instant) -> bool {
        self.state(now) != CircuitState::Open
    }

    /// Failures currently inside the window.
    pub fn recent_failures(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.failures.len()
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        self.prune(now);

        let should_open = match self.state(now) {
            CircuitState::Closed => self.failures.len() >= self.threshold as usize,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            self.state = CircuitState::Open;
            self.open_until = Some(now + self.window);
        }
        should_open
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.state = CircuitState::Closed;
        self.open_until = None;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) >= self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}
