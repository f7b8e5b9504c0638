// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::{Event, Payload};
use hashbrown::HashMap;
use tracing::debug;

#[derive(Debug, PartialEq, Eq, Hash)]
struct CounterKey {
    endpoint: String,
    name: String,
    feature: String,
    dimension: String,
}

fn counter_key(event: &Event) -> Option<CounterKey> {
    match event.payload() {
        Payload::FeatureObserved(observed) => Some(CounterKey {
            endpoint: event.endpoint().to_string(),
            name: event.name().to_string(),
            feature: observed.feature.clone(),
            dimension: observed.dimension.clone(),
        }),
        _ => None,
    }
}

/// Folds incremental counter events sharing an endpoint and dimension into
/// one event per dimension.
///
/// The first occurrence keeps its position and identity, counts are summed
/// and the hooks of every absorbed event move onto the survivor. All other
/// events pass through in order.
pub fn coalesce(events: Vec<Event>) -> Vec<Event> {
    let before = events.len();
    let mut merged: Vec<Event> = Vec::with_capacity(before);
    let mut positions: HashMap<CounterKey, usize> = HashMap::new();

    for mut event in events {
        let Some(key) = counter_key(&event) else {
            merged.push(event);
            continue;
        };
        let Some(&index) = positions.get(&key) else {
            positions.insert(key, merged.len());
            merged.push(event);
            continue;
        };
        let increment = match event.payload() {
            Payload::FeatureObserved(observed) => observed.count,
            _ => 0,
        };
        let hooks = event.take_hooks();
        let Some(survivor) = merged.get_mut(index) else {
            continue;
        };
        if let Payload::FeatureObserved(total) = survivor.payload_mut() {
            total.count = total.count.saturating_add(increment);
        }
        survivor.hooks_mut().absorb(hooks);
    }

    if merged.len() < before {
        debug!(
            "TELEMETRY | Coalesced {} events into {}",
            before,
            merged.len()
        );
    }
    merged
}
