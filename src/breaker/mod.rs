use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::metrics::MetricsRecorder;
use crate::stages::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl BreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEventKind {
    StateChange,
    SkipOperation,
    SuccessReset,
    FailureRecorded,
}

impl BreakerEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            BreakerEventKind::StateChange => "state_change",
            BreakerEventKind::SkipOperation => "skip_operation",
            BreakerEventKind::SuccessReset => "success_reset",
            BreakerEventKind::FailureRecorded => "failure_recorded",
        }
    }
}

/// Structured record of one breaker decision or transition. Operators use
/// these to correlate upstream incidents with pipeline behavior.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerEvent {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub kind: BreakerEventKind,
    pub previous_state: BreakerState,
    pub new_state: BreakerState,
    pub consecutive_failures: u32,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker guarding one stage.
///
/// Process-lifetime and shared across jobs; the two entry points
/// (`should_allow`, `record_outcome`) are the only writers and both keep
/// the critical section free of I/O. Events are delivered to the metrics
/// recorder after the lock is released.
pub struct CircuitBreaker {
    stage: Stage,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<MetricsRecorder>,
}

impl CircuitBreaker {
    pub fn new(stage: Stage, config: BreakerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            stage,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            metrics,
        }
    }

    /// Whether the guarded stage may run now. An open breaker admits exactly
    /// one probe once the cooldown has elapsed; everything else is skipped
    /// until the probe reports back.
    pub fn should_allow(&self) -> bool {
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let mut events = Vec::new();

        let allowed = {
            let mut inner = self.lock();
            match inner.state {
                BreakerState::Closed => true,
                BreakerState::Open => {
                    let cooled_down = inner
                        .opened_at
                        .map(|at| at.elapsed() >= cooldown)
                        .unwrap_or(true);
                    if cooled_down {
                        events.push(self.event(
                            BreakerEventKind::StateChange,
                            BreakerState::Open,
                            BreakerState::HalfOpen,
                            inner.consecutive_failures,
                        ));
                        inner.state = BreakerState::HalfOpen;
                        true
                    } else {
                        events.push(self.event(
                            BreakerEventKind::SkipOperation,
                            BreakerState::Open,
                            BreakerState::Open,
                            inner.consecutive_failures,
                        ));
                        false
                    }
                }
                // The probe slot is taken; later arrivals wait it out.
                BreakerState::HalfOpen => {
                    events.push(self.event(
                        BreakerEventKind::SkipOperation,
                        BreakerState::HalfOpen,
                        BreakerState::HalfOpen,
                        inner.consecutive_failures,
                    ));
                    false
                }
            }
        };

        self.emit(events);
        allowed
    }

    /// Feed one attempt outcome for the guarded stage into the machine.
    pub fn record_outcome(&self, success: bool) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            match (inner.state, success) {
                (BreakerState::Closed, true) => {
                    if inner.consecutive_failures > 0 {
                        events.push(self.event(
                            BreakerEventKind::SuccessReset,
                            BreakerState::Closed,
                            BreakerState::Closed,
                            0,
                        ));
                        inner.consecutive_failures = 0;
                    }
                }
                (BreakerState::Closed, false) => {
                    inner.consecutive_failures += 1;
                    events.push(self.event(
                        BreakerEventKind::FailureRecorded,
                        BreakerState::Closed,
                        BreakerState::Closed,
                        inner.consecutive_failures,
                    ));
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        events.push(self.event(
                            BreakerEventKind::StateChange,
                            BreakerState::Closed,
                            BreakerState::Open,
                            inner.consecutive_failures,
                        ));
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                }
                (BreakerState::HalfOpen, true) => {
                    events.push(self.event(
                        BreakerEventKind::StateChange,
                        BreakerState::HalfOpen,
                        BreakerState::Closed,
                        inner.consecutive_failures,
                    ));
                    events.push(self.event(
                        BreakerEventKind::SuccessReset,
                        BreakerState::HalfOpen,
                        BreakerState::Closed,
                        0,
                    ));
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
                (BreakerState::HalfOpen, false) => {
                    inner.consecutive_failures += 1;
                    events.push(self.event(
                        BreakerEventKind::FailureRecorded,
                        BreakerState::HalfOpen,
                        BreakerState::HalfOpen,
                        inner.consecutive_failures,
                    ));
                    events.push(self.event(
                        BreakerEventKind::StateChange,
                        BreakerState::HalfOpen,
                        BreakerState::Open,
                        inner.consecutive_failures,
                    ));
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
                // Outcomes reported while fully open (callers that raced the
                // transition) only bump the counter.
                (BreakerState::Open, false) => {
                    inner.consecutive_failures += 1;
                    events.push(self.event(
                        BreakerEventKind::FailureRecorded,
                        BreakerState::Open,
                        BreakerState::Open,
                        inner.consecutive_failures,
                    ));
                }
                (BreakerState::Open, true) => {}
            }
        }

        self.emit(events);
    }

    /// The stage this breaker guards.
    pub fn guarded_stage(&self) -> Stage {
        self.stage
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn event(
        &self,
        kind: BreakerEventKind,
        previous_state: BreakerState,
        new_state: BreakerState,
        consecutive_failures: u32,
    ) -> BreakerEvent {
        BreakerEvent {
            at: Utc::now(),
            stage: self.stage,
            kind,
            previous_state,
            new_state,
            consecutive_failures,
        }
    }

    fn emit(&self, events: Vec<BreakerEvent>) {
        for event in events {
            match event.kind {
                BreakerEventKind::StateChange => warn!(
                    stage = %event.stage,
                    from = %event.previous_state,
                    to = %event.new_state,
                    failures = event.consecutive_failures,
                    "circuit breaker state change"
                ),
                BreakerEventKind::SkipOperation => info!(
                    stage = %event.stage,
                    state = %event.previous_state,
                    "circuit breaker skipping stage"
                ),
                BreakerEventKind::SuccessReset => info!(
                    stage = %event.stage,
                    "circuit breaker failure count reset"
                ),
                BreakerEventKind::FailureRecorded => debug!(
                    stage = %event.stage,
                    failures = event.consecutive_failures,
                    "circuit breaker recorded failure"
                ),
            }
            self.metrics.record_breaker_event(event);
        }
    }
}
