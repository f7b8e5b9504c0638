// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive send interval and admission capacity.
//!
//! [`RetryState`] is a plain value and [`next_state`] is pure, so the backoff
//! rules can be tested without timers. [`Scheduler`] owns the one mutable
//! state plus the deadline of the single repeating timer.

use crate::config::RetryConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff bookkeeping between send cycles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    pub time_period: Duration,
    pub queue_capacity: usize,
    pub time_attempts: u32,
    pub capacity_attempts: u32,
    /// Set when the current cycle was forced by admission control
    pub triggered_due_to_overflow: bool,
}

impl RetryState {
    #[must_use]
    pub fn initial(config: &RetryConfig) -> Self {
        Self {
            time_period: config.base_timer,
            queue_capacity: config.base_capacity,
            time_attempts: 1,
            capacity_attempts: 1,
            triggered_due_to_overflow: false,
        }
    }
}

/// How a send cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing had to be re-queued
    Delivered,
    /// At least one event went back to the queue
    Retrying,
}

/// `1 + (sample × 2 − 1) × jitter_factor`, with `sample` in `[0, 1)`.
fn jitter_multiplier(jitter_factor: f64, sample: f64) -> f64 {
    1.0 + (sample * 2.0 - 1.0) * jitter_factor
}

fn grow(base: f64, config: &RetryConfig, attempts: u32, ceiling: f64, sample: f64) -> f64 {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
    let uncapped = base * config.backoff_factor.powi(exponent);
    let capped = uncapped.min(ceiling);
    (capped * jitter_multiplier(config.jitter_factor, sample)).floor()
}

/// `floor(min(base_timer × factor^attempts, max_delay) × jitter)`
#[must_use]
pub fn calculate_delay(config: &RetryConfig, attempts: u32, sample: f64) -> Duration {
    let millis = grow(
        config.base_timer.as_millis() as f64,
        config,
        attempts,
        config.max_delay.as_millis() as f64,
        sample,
    );
    Duration::from_millis(millis.max(1.0) as u64)
}

/// Capacity counterpart of [`calculate_delay`]. Unlike the delay, the jittered
/// result never exceeds `max_capacity`.
#[must_use]
pub fn calculate_capacity(config: &RetryConfig, attempts: u32, sample: f64) -> usize {
    let ceiling = config.max_capacity as f64;
    let capacity = grow(config.base_capacity as f64, config, attempts, ceiling, sample);
    capacity.clamp(1.0, ceiling.max(1.0)) as usize
}

#[must_use]
pub fn increase_time_period(state: RetryState, config: &RetryConfig, sample: f64) -> RetryState {
    if state.time_attempts >= config.max_retries {
        return state;
    }
    RetryState {
        time_period: calculate_delay(config, state.time_attempts, sample),
        time_attempts: state.time_attempts + 1,
        ..state
    }
}

#[must_use]
pub fn increase_queue_capacity(state: RetryState, config: &RetryConfig, sample: f64) -> RetryState {
    if state.capacity_attempts >= config.max_retries {
        return state;
    }
    RetryState {
        queue_capacity: calculate_capacity(config, state.capacity_attempts, sample),
        capacity_attempts: state.capacity_attempts + 1,
        ..state
    }
}

/// State for the cycle after one that ended with `outcome`.
///
/// A delivered cycle resets to the baselines. A retrying cycle escalates
/// exactly one path: capacity when the cycle was forced by overflow, the send
/// interval otherwise.
#[must_use]
pub fn next_state(
    state: RetryState,
    outcome: CycleOutcome,
    config: &RetryConfig,
    sample: f64,
) -> RetryState {
    match outcome {
        CycleOutcome::Delivered => RetryState::initial(config),
        CycleOutcome::Retrying if state.triggered_due_to_overflow => RetryState {
            triggered_due_to_overflow: false,
            ..increase_queue_capacity(state, config, sample)
        },
        CycleOutcome::Retrying => increase_time_period(state, config, sample),
    }
}

/// Owner of the retry state and the single repeating timer.
#[derive(Debug)]
pub struct Scheduler {
    config: RetryConfig,
    state: RetryState,
    deadline: Option<Instant>,
    handler_registered: bool,
    rng: fastrand::Rng,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self::with_rng(config, fastrand::Rng::new())
    }

    #[must_use]
    pub fn with_rng(config: RetryConfig, rng: fastrand::Rng) -> Self {
        Self {
            state: RetryState::initial(&config),
            config,
            deadline: None,
            handler_registered: false,
            rng,
        }
    }

    /// Marks the send cycle as ready to be driven by ticks.
    pub fn register_handler(&mut self) {
        self.handler_registered = true;
    }

    /// Arms the timer at the current period, after optionally resetting to the baselines.
    pub fn start_timer(&mut self, reset_parameters: bool) {
        if !self.handler_registered {
            warn!("TELEMETRY | Ignoring timer start: no send cycle registered");
            return;
        }
        if reset_parameters {
            self.state = RetryState::initial(&self.config);
        }
        self.deadline = Some(Instant::now() + self.state.time_period);
        debug!(
            "TELEMETRY | Next send cycle in {}ms",
            self.state.time_period.as_millis()
        );
    }

    pub fn clear_timer(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Pushes the deadline one period forward after a tick that had nothing to send.
    pub fn rearm(&mut self) {
        if self.deadline.is_some() {
            self.deadline = Some(Instant::now() + self.state.time_period);
        }
    }

    #[must_use]
    pub fn state(&self) -> RetryState {
        self.state
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.state.queue_capacity
    }

    pub fn mark_overflow(&mut self) {
        self.state.triggered_due_to_overflow = true;
    }

    pub fn increase_time_period(&mut self) {
        let sample = self.rng.f64();
        self.state = increase_time_period(self.state, &self.config, sample);
    }

    pub fn increase_queue_capacity(&mut self) {
        let sample = self.rng.f64();
        self.state = increase_queue_capacity(self.state, &self.config, sample);
    }

    /// Feeds a finished cycle into the state machine and re-arms the timer.
    pub fn record_cycle(&mut self, outcome: CycleOutcome) {
        let sample = self.rng.f64();
        self.state = next_state(self.state, outcome, &self.config, sample);
        self.start_timer(outcome == CycleOutcome::Delivered);
    }
}
