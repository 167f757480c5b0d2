//! Per-target circuit breakers.
//!
//! Closed admits calls and counts consecutive failures. At the threshold
//! the breaker opens and rejects every call until the cooldown elapses,
//! after which exactly one probe is admitted (HalfOpen). The probe's
//! outcome closes or reopens the breaker.
//!
//! Every flip is written to the state store before it takes effect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<CircuitState> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

/// A persisted breaker flip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Verdict for one prospective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial call of a half-open breaker.
    Probe,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct BreakerRegistry {
    config: BreakerConfig,
    store: Arc<dyn StateStore>,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Rebuild breaker states from persisted flips.
    ///
    /// Open and HalfOpen breakers come back Open with a fresh cooldown.
    pub fn restore(&self) -> Result<(), StoreError> {
        let transitions = self.store.load_breakers()?;
        let mut breakers = self.lock();
        breakers.clear();
        for t in transitions {
            let breaker = breakers.entry(t.target.clone()).or_default();
            breaker.failures = t.consecutive_failures;
            breaker.probe_in_flight = false;
            match t.to {
                CircuitState::Closed => {
                    breaker.state = CircuitState::Closed;
                    breaker.failures = 0;
                    breaker.opened_at = None;
                }
                CircuitState::Open | CircuitState::HalfOpen => {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
        }
        let open = breakers
            .values()
            .filter(|b| b.state == CircuitState::Open)
            .count();
        if open > 0 {
            tracing::info!(open, "restored open breakers");
        }
        Ok(())
    }

    pub fn state(&self, target: &str) -> CircuitState {
        self.lock()
            .get(target)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Decide whether a call to `target` may go out now.
    pub fn admit(&self, target: &str) -> Result<Admission, StoreError> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(target.to_string()).or_default();

        match breaker.state {
            CircuitState::Closed => Ok(Admission::Allowed),
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.cooldown);
                if elapsed < self.config.cooldown {
                    return Ok(Admission::Rejected {
                        retry_after: self.config.cooldown - elapsed,
                    });
                }
                self.persist(target, breaker, CircuitState::HalfOpen)?;
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                tracing::info!(target, "breaker half-open, admitting probe");
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen if breaker.probe_in_flight => Ok(Admission::Rejected {
                retry_after: self.config.cooldown,
            }),
            CircuitState::HalfOpen => {
                breaker.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    /// Record a successful call. `probe` marks the call admitted as the
    /// half-open trial; only that call may close a half-open breaker.
    pub fn record_success(&self, target: &str, probe: bool) -> Result<(), StoreError> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(target.to_string()).or_default();

        match breaker.state {
            CircuitState::HalfOpen if probe => {
                self.persist(target, breaker, CircuitState::Closed)?;
                *breaker = Breaker::default();
                tracing::info!(target, "probe succeeded, breaker closed");
            }
            CircuitState::Closed => breaker.failures = 0,
            // Calls admitted before the breaker opened leave it as it is.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
        Ok(())
    }

    /// Record a failed call. As with [`Self::record_success`], only the
    /// probe decides a half-open breaker.
    pub fn record_failure(&self, target: &str, probe: bool) -> Result<(), StoreError> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(target.to_string()).or_default();
        let failures = breaker.failures.saturating_add(1);

        match breaker.state {
            CircuitState::Closed if failures >= self.config.threshold => {
                breaker.failures = failures;
                if let Err(e) = self.persist(target, breaker, CircuitState::Open) {
                    breaker.failures -= 1;
                    return Err(e);
                }
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                tracing::warn!(target, failures, "breaker opened");
            }
            CircuitState::HalfOpen if probe => {
                breaker.failures = failures;
                if let Err(e) = self.persist(target, breaker, CircuitState::Open) {
                    breaker.failures -= 1;
                    return Err(e);
                }
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.probe_in_flight = false;
                tracing::warn!(target, "probe failed, breaker reopened");
            }
            CircuitState::HalfOpen => {
                tracing::debug!(target, "late failure ignored while probe in flight");
            }
            CircuitState::Closed | CircuitState::Open => breaker.failures = failures,
        }
        Ok(())
    }

    /// Give back a probe slot whose call ended without an outcome
    /// (cancelled or deadline).
    pub fn release_probe(&self, target: &str) {
        if let Some(breaker) = self.lock().get_mut(target) {
            breaker.probe_in_flight = false;
        }
    }

    fn persist(&self, target: &str, breaker: &Breaker, to: CircuitState) -> Result<(), StoreError> {
        self.store.append_breaker(&BreakerTransition {
            target: target.to_string(),
            from: breaker.state,
            to,
            consecutive_failures: breaker.failures,
            at: Utc::now(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
