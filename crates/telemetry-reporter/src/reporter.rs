// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The reporter task and the handle producers talk to.
//!
//! [`ReporterService`] owns the queue, the scheduler and the transport, and is
//! driven by one loop that either handles a [`ReporterCommand`] or runs a
//! send cycle when the scheduler's deadline passes. Producers never wait on
//! the network, except for [`ReporterHandle::close_event`] which returns once
//! the first close cycle has completed.

use crate::cache::BatchCache;
use crate::coalesce::coalesce;
use crate::config::RetryConfig;
use crate::constants::{CLOSE_ENDPOINT, CLOSE_EVENT, MAX_RETRY_ON_CLOSE};
use crate::event::{ClosePayload, Event, EventHooks, Payload};
use crate::identity::Identity;
use crate::queue::EventQueue;
use crate::retry::{CycleOutcome, RetryState, Scheduler};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

#[derive(Debug)]
pub enum ReporterCommand {
    Start(Event),
    Enqueue(Event),
    Close(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<ReporterSnapshot>),
    Shutdown,
}

/// Where the reporter is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// A close event was issued; `retries` extra cycles have run since.
    Draining { retries: u32 },
    /// Drain finished; new events are ignored.
    Closed,
}

/// Point-in-time view of the reporter, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct ReporterSnapshot {
    pub queued: Vec<String>,
    pub retry_state: RetryState,
    pub timer_armed: bool,
    pub lifecycle: Lifecycle,
}

#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::UnboundedSender<ReporterCommand>,
    cache: Arc<BatchCache>,
    identity: Identity,
}

impl ReporterHandle {
    /// Identity to build events with.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Stable pseudonymous id for a volatile fingerprint such as a workspace path.
    ///
    /// Blocks on the cache store; call it from `spawn_blocking` inside async code.
    pub fn stable_id_for(&self, volatile_id: &str) -> String {
        self.cache.stable_id_for(volatile_id)
    }

    /// Arms the scheduler and queues `startup` unless an identical payload was
    /// already delivered under the same name. Only the first call has any effect.
    pub fn start_event(&self, startup: Event) {
        self.send(ReporterCommand::Start(startup));
    }

    pub fn add_event_to_queue(&self, event: Event) {
        self.send(ReporterCommand::Enqueue(event));
    }

    /// Queues the close event and waits for one send cycle. Remaining
    /// retries continue on the timer for a bounded number of cycles.
    pub async fn close_event(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if !self.send(ReporterCommand::Close(response_tx)) {
            return;
        }
        if let Err(e) = response_rx.await {
            debug!("TELEMETRY | Failed to receive close response: {}", e);
        }
    }

    pub async fn snapshot(&self) -> Option<ReporterSnapshot> {
        let (response_tx, response_rx) = oneshot::channel();
        if !self.send(ReporterCommand::Snapshot(response_tx)) {
            return None;
        }
        response_rx.await.ok()
    }

    /// Stops the reporter without draining.
    pub fn shutdown(&self) {
        self.send(ReporterCommand::Shutdown);
    }

    fn send(&self, command: ReporterCommand) -> bool {
        match self.tx.send(command) {
            Ok(()) => true,
            Err(e) => {
                debug!("TELEMETRY | Reporter is not running: {}", e);
                false
            }
        }
    }
}

pub struct ReporterService {
    queue: EventQueue,
    scheduler: Scheduler,
    transport: Transport,
    cache: Arc<BatchCache>,
    identity: Identity,
    started_at: Instant,
    started: bool,
    lifecycle: Lifecycle,
    rx: mpsc::UnboundedReceiver<ReporterCommand>,
}

impl ReporterService {
    pub fn new(
        retry: RetryConfig,
        transport: Transport,
        cache: Arc<BatchCache>,
        identity: Identity,
    ) -> (Self, ReporterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Self {
            queue: EventQueue::new(),
            scheduler: Scheduler::new(retry),
            transport,
            cache: Arc::clone(&cache),
            identity: identity.clone(),
            started_at: Instant::now(),
            started: false,
            lifecycle: Lifecycle::Running,
            rx,
        };

        let handle = ReporterHandle {
            tx,
            cache,
            identity,
        };

        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("TELEMETRY | Reporter service started");
        self.scheduler.register_handler();

        loop {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                biased;
                () = wait_for(deadline) => {
                    self.on_tick().await;
                }
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        debug!("TELEMETRY | All reporter handles dropped");
                        break;
                    };
                    if !self.handle(command).await {
                        break;
                    }
                }
            }
        }

        debug!("TELEMETRY | Reporter service stopped");
    }

    /// Returns false when the loop should stop.
    async fn handle(&mut self, command: ReporterCommand) -> bool {
        match command {
            ReporterCommand::Start(startup) => self.start(startup).await,

            ReporterCommand::Enqueue(event) => {
                if self.lifecycle == Lifecycle::Closed {
                    debug!(
                        "TELEMETRY | Ignoring event {} after close",
                        event.name()
                    );
                } else {
                    self.admit(event).await;
                }
            }

            ReporterCommand::Close(response_tx) => {
                self.close().await;
                if response_tx.send(()).is_err() {
                    error!("TELEMETRY | Failed to send close response - receiver dropped");
                }
            }

            ReporterCommand::Snapshot(response_tx) => {
                if response_tx.send(self.snapshot()).is_err() {
                    error!("TELEMETRY | Failed to send snapshot - receiver dropped");
                }
            }

            ReporterCommand::Shutdown => {
                debug!("TELEMETRY | Reporter service shutting down");
                return false;
            }
        }
        true
    }

    fn snapshot(&self) -> ReporterSnapshot {
        ReporterSnapshot {
            queued: self.queue.names().map(str::to_string).collect(),
            retry_state: self.scheduler.state(),
            timer_armed: self.scheduler.is_armed(),
            lifecycle: self.lifecycle,
        }
    }

    async fn start(&mut self, startup: Event) {
        if self.started || self.lifecycle != Lifecycle::Running {
            debug!("TELEMETRY | Reporter already started, ignoring start event");
            return;
        }
        self.started = true;
        self.scheduler.start_timer(true);

        let hash = match startup.payload_hash() {
            Ok(hash) => hash,
            Err(e) => {
                debug!("TELEMETRY | Unable to hash {} payload: {}", startup.name(), e);
                self.admit(startup).await;
                return;
            }
        };
        if self.cache.dedup_get(startup.name()).as_deref() == Some(hash.as_str()) {
            debug!(
                "TELEMETRY | Skipping {} event, payload unchanged since last delivery",
                startup.name()
            );
            return;
        }

        // Recorded only once delivered, so a failed startup is resent next time
        let cache = Arc::clone(&self.cache);
        let name = startup.name().to_string();
        let startup = startup.with_hooks(EventHooks::default().on_success(move || {
            cache.dedup_put(&name, &hash);
        }));
        self.admit(startup).await;
    }

    /// Queues `event`, running a cycle right away once capacity is reached.
    async fn admit(&mut self, event: Event) {
        self.queue.enqueue(event);
        if self.queue.size() < self.scheduler.queue_capacity() {
            return;
        }

        debug!(
            "TELEMETRY | Queue reached capacity {}, sending now",
            self.scheduler.queue_capacity()
        );
        self.scheduler.mark_overflow();
        self.send_cycle().await;
        self.queue.adjust_queue_size(self.scheduler.queue_capacity());
    }

    async fn close(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            debug!("TELEMETRY | Close already requested");
            return;
        }
        let elapsed = self.started_at.elapsed();
        let close = Event::new(
            CLOSE_EVENT,
            CLOSE_ENDPOINT,
            Payload::Close(ClosePayload {
                session_duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            }),
            &self.identity,
        );
        self.queue.enqueue(close);
        self.lifecycle = Lifecycle::Draining { retries: 0 };

        self.send_cycle().await;
        self.settle_drain();
    }

    async fn on_tick(&mut self) {
        self.send_cycle().await;
        if let Lifecycle::Draining { retries } = &mut self.lifecycle {
            *retries += 1;
        }
        self.settle_drain();
    }

    /// Ends the close drain once the queue is empty or the retry budget is spent.
    fn settle_drain(&mut self) {
        let Lifecycle::Draining { retries } = self.lifecycle else {
            return;
        };
        if !self.queue.is_empty() && retries < MAX_RETRY_ON_CLOSE {
            return;
        }

        self.scheduler.clear_timer();
        let dropped = self.queue.flush();
        if !dropped.is_empty() {
            debug!(
                "TELEMETRY | Close drain finished after {} retries, dropping {} events",
                retries,
                dropped.len()
            );
        }
        self.lifecycle = Lifecycle::Closed;
    }

    /// Flushes the queue, posts the batch and feeds the result back into the
    /// queue and the scheduler.
    async fn send_cycle(&mut self) {
        let events = self.queue.flush();
        if events.is_empty() {
            self.scheduler.rearm();
            return;
        }
        self.scheduler.clear_timer();

        let batch = coalesce(events);
        let response = self.transport.post(batch).await;

        let succeeded: Vec<Event> = response
            .success
            .into_iter()
            .map(|outcome| outcome.event)
            .filter(Event::has_hooks)
            .collect();
        let failed: Vec<Event> = response
            .failures
            .iter()
            .map(|outcome| outcome.event.clone())
            .filter(Event::has_hooks)
            .collect();
        fire_hooks(succeeded, failed).await;

        let mut retry = Vec::new();
        for outcome in response.failures {
            if outcome.is_retryable() {
                retry.push(outcome.event);
            } else {
                debug!(
                    "TELEMETRY | Dropping event {} after status {}",
                    outcome.event.name(),
                    outcome.status
                );
            }
        }

        let cycle = if retry.is_empty() {
            CycleOutcome::Delivered
        } else {
            debug!("TELEMETRY | Re-queueing {} events for retry", retry.len());
            CycleOutcome::Retrying
        };
        self.queue.concat(retry, true);
        self.scheduler.record_cycle(cycle);
    }
}

/// Hooks may write to a file-backed cache, so they run on the blocking pool.
/// The cycle waits for them so a delivered startup is recorded before the
/// next command is handled.
async fn fire_hooks(succeeded: Vec<Event>, failed: Vec<Event>) {
    if succeeded.is_empty() && failed.is_empty() {
        return;
    }
    let fired = tokio::task::spawn_blocking(move || {
        for event in &succeeded {
            event.notify_success();
        }
        for event in &failed {
            event.notify_fail();
        }
    })
    .await;
    if let Err(e) = fired {
        error!("TELEMETRY | Event hook failed: {}", e);
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
