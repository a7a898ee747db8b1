//! Per-upstream circuit breakers.
//!
//! ```text
//!            failure ratio over window >= threshold
//!   CLOSED ------------------------------------------> OPEN
//!     ^                                                 |
//!     | all probes succeed                              | open duration elapsed
//!     |                                                 v
//!     +-------------------------------------------- HALF_OPEN
//!                     any probe fails: back to OPEN
//! ```
//!
//! Outcomes are reported through a [`BreakerPermit`] handed out at admission. A permit
//! dropped without an outcome, e.g. because the client went away, counts as neither
//! success nor failure.

use crate::config::CircuitBreakerConfig;
use crate::context::RequestContext;
use crate::errors::GatewayError;
use crate::filters::Filter;
use crate::metrics_defs::BREAKER_TRANSITIONS;
use crate::routes::Fallback;
use parking_lot::Mutex;
use serde::Serialize;
use shared::counter;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const WINDOW_SLOTS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
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
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    epoch: u64,
    total: u32,
    failures: u32,
}

/// Outcome counts over the last `window`, kept in fixed time slots.
#[derive(Debug)]
struct RollingWindow {
    origin: Instant,
    slot_len: Duration,
    slots: [Slot; WINDOW_SLOTS],
}

impl RollingWindow {
    fn new(window: Duration, origin: Instant) -> Self {
        RollingWindow {
            origin,
            slot_len: (window / WINDOW_SLOTS as u32).max(Duration::from_millis(1)),
            slots: [Slot::default(); WINDOW_SLOTS],
        }
    }

    fn epoch(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.origin).as_nanos() / self.slot_len.as_nanos()) as u64
    }

    fn record(&mut self, now: Instant, outcome: Outcome) {
        let epoch = self.epoch(now);
        let slot = &mut self.slots[(epoch % WINDOW_SLOTS as u64) as usize];
        if slot.epoch != epoch {
            *slot = Slot {
                epoch,
                ..Slot::default()
            };
        }
        slot.total += 1;
        if outcome == Outcome::Failure {
            slot.failures += 1;
        }
    }

    /// (total, failures) across the slots still inside the window.
    fn totals(&self, now: Instant) -> (u32, u32) {
        let epoch = self.epoch(now);
        self.slots
            .iter()
            .filter(|slot| slot.epoch <= epoch && epoch - slot.epoch < WINDOW_SLOTS as u64)
            .fold((0, 0), |(total, failures), slot| {
                (total + slot.total, failures + slot.failures)
            })
    }

    fn reset(&mut self) {
        self.slots = [Slot::default(); WINDOW_SLOTS];
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    window: RollingWindow,
    open_until: Option<Instant>,
    probe_successes: u32,
    /// Bumped on every transition so permits from an earlier state are ignored
    generation: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    probes_in_flight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        CircuitBreaker {
            name: name.into(),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: RollingWindow::new(config.window(), now),
                open_until: None,
                probe_successes: 0,
                generation: 0,
            }),
            config,
            probes_in_flight: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        let mut state = self.state.lock();
        self.advance(&mut state, now);
        state.state
    }

    // OPEN turns into HALF_OPEN lazily, the first time anyone looks after the deadline.
    fn advance(&self, state: &mut BreakerState, now: Instant) {
        if state.state == CircuitState::Open && state.open_until.is_some_and(|until| now >= until)
        {
            self.transition(state, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = state.state;
        state.state = to;
        state.generation += 1;

        match to {
            CircuitState::Open => {
                state.open_until = Some(now + self.config.open_duration());
                tracing::warn!(
                    service = %self.name,
                    %from,
                    open_ms = self.config.open_duration_ms,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                state.open_until = None;
                state.probe_successes = 0;
                self.probes_in_flight.store(0, Ordering::SeqCst);
                tracing::info!(service = %self.name, "Circuit breaker half-open, probing upstream");
            }
            CircuitState::Closed => {
                state.open_until = None;
                state.window.reset();
                tracing::info!(service = %self.name, "Circuit breaker closed");
            }
        }

        counter!(
            BREAKER_TRANSITIONS,
            "service" => self.name.clone(),
            "state" => to.as_str()
        )
        .increment(1);
    }

    /// Asks to send one call upstream. Rejections carry the state that refused.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, CircuitState> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(self: &Arc<Self>, now: Instant) -> Result<BreakerPermit, CircuitState> {
        let mut state = self.state.lock();
        self.advance(&mut state, now);

        let probe = match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => return Err(CircuitState::Open),
            CircuitState::HalfOpen => {
                let limit = self.config.probe_count;
                self.probes_in_flight
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < limit).then_some(n + 1)
                    })
                    .map_err(|_| CircuitState::HalfOpen)?;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: self.clone(),
            generation: state.generation,
            probe,
            settled: false,
        })
    }

    fn on_outcome(&self, generation: u64, probe: bool, outcome: Outcome, now: Instant) {
        let mut state = self.state.lock();
        self.advance(&mut state, now);
        if state.generation != generation {
            return;
        }

        match state.state {
            CircuitState::Closed => {
                state.window.record(now, outcome);
                let (total, failures) = state.window.totals(now);
                if total >= self.config.min_throughput
                    && f64::from(failures) / f64::from(total) >= self.config.failure_ratio
                {
                    self.transition(&mut state, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen if probe => {
                self.probes_in_flight.fetch_sub(1, Ordering::SeqCst);
                match outcome {
                    Outcome::Failure => self.transition(&mut state, CircuitState::Open, now),
                    Outcome::Success => {
                        state.probe_successes += 1;
                        if state.probe_successes >= self.config.probe_count {
                            self.transition(&mut state, CircuitState::Closed, now);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn release(&self, generation: u64, probe: bool) {
        if !probe {
            return;
        }
        let state = self.state.lock();
        if state.generation == generation && state.state == CircuitState::HalfOpen {
            self.probes_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Admission to call an upstream, to be settled with the call's [`Outcome`].
#[must_use]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(self, outcome: Outcome) {
        self.record_at(outcome, Instant::now())
    }

    pub fn record_at(mut self, outcome: Outcome, now: Instant) {
        self.settled = true;
        self.breaker
            .on_outcome(self.generation, self.probe, outcome, now);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation, self.probe);
        }
    }
}

/// One breaker per upstream, created at startup and never resized.
pub struct BreakerTable {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerTable {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, config: &CircuitBreakerConfig) -> Self {
        BreakerTable {
            breakers: names
                .into_iter()
                .map(|name| {
                    (
                        name.to_string(),
                        Arc::new(CircuitBreaker::new(name, config.clone())),
                    )
                })
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}

pub struct CircuitBreakerFilter {
    table: Arc<BreakerTable>,
}

impl CircuitBreakerFilter {
    pub fn new(table: Arc<BreakerTable>) -> Self {
        CircuitBreakerFilter { table }
    }
}

impl Filter for CircuitBreakerFilter {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let route = ctx.route()?;
        let Some(name) = route.circuit_breaker.as_deref() else {
            return Ok(());
        };
        let Some(breaker) = self.table.get(name) else {
            tracing::warn!(breaker = name, "Route references an unknown circuit breaker");
            return Ok(());
        };

        match breaker.try_acquire() {
            Ok(permit) => {
                ctx.breaker_permit = Some(permit);
                Ok(())
            }
            Err(state) => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    service = name,
                    %state,
                    "Circuit breaker rejected request"
                );
                Err(GatewayError::CircuitOpen {
                    service: name.to_string(),
                    fallback: route.fallback.clone().unwrap_or_else(Fallback::generic),
                })
            }
        }
    }
}
