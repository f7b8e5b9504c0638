// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::Event;
use hashbrown::HashSet;
use std::collections::VecDeque;
use tracing::debug;

/// Pending events, FIFO.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn dequeue(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Empties the queue and returns everything it held, oldest first.
    pub fn flush(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Appends `events`, or puts them ahead of everything queued when
    /// `merge_at_start` is set. Relative order of `events` is kept either way.
    pub fn concat(&mut self, events: Vec<Event>, merge_at_start: bool) {
        if merge_at_start {
            for event in events.into_iter().rev() {
                self.events.push_front(event);
            }
        } else {
            self.events.extend(events);
        }
    }

    /// Sheds load once the queue holds more than `max_retain` events.
    ///
    /// Among the oldest `size() - max_retain` events only the first of each
    /// name survives; newer events are left untouched.
    pub fn adjust_queue_size(&mut self, max_retain: usize) {
        let excess = self.events.len().saturating_sub(max_retain);
        if excess == 0 {
            return;
        }

        let remainder = self.events.split_off(excess);
        let mut seen: HashSet<String> = HashSet::new();
        let before = self.events.len();
        self.events.retain(|event| seen.insert(event.name().to_string()));
        let dropped = before - self.events.len();
        self.events.extend(remainder);

        if dropped > 0 {
            debug!(
                "TELEMETRY | Dropped {} duplicate events, {} still queued",
                dropped,
                self.events.len()
            );
        }
    }

    /// Names in queue order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(Event::name)
    }
}
