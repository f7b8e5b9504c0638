// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry events and the closed set of payload shapes they carry.

use crate::identity::Identity;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Callbacks fired once per terminal outcome of a send attempt.
///
/// Coalesced events carry the hooks of every event they absorbed.
#[derive(Clone, Default)]
pub struct EventHooks {
    on_success: Vec<Hook>,
    on_fail: Vec<Hook>,
}

impl EventHooks {
    #[must_use]
    pub fn on_success(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_success.push(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_fail(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_fail.push(Arc::new(hook));
        self
    }

    pub(crate) fn absorb(&mut self, other: EventHooks) {
        self.on_success.extend(other.on_success);
        self.on_fail.extend(other.on_fail);
    }

    fn fire_success(&self) {
        for hook in &self.on_success {
            hook();
        }
    }

    fn fire_fail(&self) {
        for hook in &self.on_fail {
            hook();
        }
    }
}

impl fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHooks")
            .field("on_success", &self.on_success.len())
            .field("on_fail", &self.on_fail.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupPayload {
    pub app_version: String,
    pub platform: String,
    pub arch: String,
    /// May contain the user's home directory
    pub install_path: String,
    pub settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    pub session_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceChangePayload {
    /// Stable pseudonymous id, see [`crate::cache::BatchCache::stable_id_for`]
    pub workspace_id: String,
    pub file_count: u64,
    pub languages: Vec<String>,
}

/// Incremental counter for one feature along one dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureObservedPayload {
    pub feature: String,
    pub dimension: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub stack: Option<String>,
    pub command: Option<String>,
}

/// Event-specific data. Serialized as a flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Startup(StartupPayload),
    Close(ClosePayload),
    WorkspaceChange(WorkspaceChangePayload),
    FeatureObserved(FeatureObservedPayload),
    Error(ErrorPayload),
    /// Free-form properties, scrubbed through the transformable allow-list
    Custom(Map<String, Value>),
}

/// One telemetry record.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    endpoint: String,
    payload: Payload,
    identity: Identity,
    hooks: EventHooks,
    scrubbed: bool,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        payload: Payload,
        identity: &Identity,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            payload,
            identity: identity.clone(),
            hooks: EventHooks::default(),
            scrubbed: false,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: EventHooks) -> Self {
        self.hooks.absorb(hooks);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// Set once the payload went through redaction. Retried events are not
    /// redacted again.
    pub(crate) fn is_scrubbed(&self) -> bool {
        self.scrubbed
    }

    pub(crate) fn mark_scrubbed(&mut self) {
        self.scrubbed = true;
    }

    pub(crate) fn has_hooks(&self) -> bool {
        !self.hooks.on_success.is_empty() || !self.hooks.on_fail.is_empty()
    }

    pub(crate) fn hooks_mut(&mut self) -> &mut EventHooks {
        &mut self.hooks
    }

    pub(crate) fn take_hooks(&mut self) -> EventHooks {
        std::mem::take(&mut self.hooks)
    }

    /// Wire body: the payload object with the identity fields merged in.
    pub fn body(&self) -> Result<Value, serde_json::Error> {
        let value = serde_json::to_value(&self.payload)?;
        Ok(match value {
            Value::Object(mut map) => {
                map.insert(
                    "installationId".to_string(),
                    Value::String(self.identity.installation_id.clone()),
                );
                map.insert(
                    "sessionId".to_string(),
                    Value::String(self.identity.session_id.clone()),
                );
                Value::Object(map)
            }
            other => other,
        })
    }

    /// Hex sha256 of the payload alone, identity excluded so that restarts
    /// with identical payloads hash the same.
    pub fn payload_hash(&self) -> Result<String, serde_json::Error> {
        let encoded = serde_json::to_vec(&self.payload)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hex::encode(hasher.finalize()))
    }

    pub(crate) fn notify_success(&self) {
        self.hooks.fire_success();
    }

    pub(crate) fn notify_fail(&self) {
        self.hooks.fire_fail();
    }
}
