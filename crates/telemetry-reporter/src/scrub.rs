// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redaction of personally identifying substrings before transmission.
//!
//! Each payload shape names the fields that may carry user data; only those
//! are rewritten. Free-form [`Payload::Custom`] objects are walked recursively
//! and rewritten wherever a key is on [`TRANSFORMABLE_PROPERTIES`].

use crate::constants::REDACTION_TOKEN;
use crate::event::{ErrorPayload, Payload, StartupPayload};
use serde_json::{Map, Value};
use std::env;

/// Keys whose string values are rewritten inside custom payloads.
pub const TRANSFORMABLE_PROPERTIES: &[&str] = &[
    "message",
    "stack",
    "path",
    "installPath",
    "command",
    "detail",
    "uri",
];

/// Shorter literals would match nearly every path or word.
const MIN_LITERAL_LEN: usize = 2;

const ENVIRONMENT_SOURCES: &[&str] = &[
    "USER",
    "USERNAME",
    "LOGNAME",
    "HOSTNAME",
    "COMPUTERNAME",
    "HOME",
    "USERPROFILE",
];

#[derive(Debug, Clone)]
pub struct Scrubber {
    /// Longest first so that a literal containing another is replaced whole
    literals: Vec<String>,
    token: String,
}

impl Scrubber {
    pub fn new<I, S>(literals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut literals: Vec<String> = literals
            .into_iter()
            .map(Into::into)
            .map(|literal: String| literal.trim().to_string())
            .filter(|literal| {
                literal.chars().count() >= MIN_LITERAL_LEN
                    && !REDACTION_TOKEN.contains(literal.as_str())
            })
            .collect();
        literals.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        literals.dedup();
        Self {
            literals,
            token: REDACTION_TOKEN.to_string(),
        }
    }

    /// Literals found in the usual user/host environment variables plus `extra`.
    pub fn from_environment(extra: &[String]) -> Self {
        let from_env = ENVIRONMENT_SOURCES
            .iter()
            .filter_map(|name| env::var(name).ok());
        Self::new(from_env.chain(extra.iter().cloned()))
    }

    #[must_use]
    pub fn literals(&self) -> &[String] {
        &self.literals
    }

    #[must_use]
    pub fn scrub_str(&self, input: &str) -> String {
        let mut output = input.to_string();
        for literal in &self.literals {
            if output.contains(literal.as_str()) {
                output = output.replace(literal.as_str(), &self.token);
            }
        }
        output
    }

    fn scrub_in_place(&self, field: &mut String) {
        if self.literals.is_empty() {
            return;
        }
        let scrubbed = self.scrub_str(field);
        if scrubbed != *field {
            *field = scrubbed;
        }
    }

    /// Walks `value`; strings are rewritten only when reached through a
    /// transformable key, including inside arrays held by such a key.
    fn scrub_value(&self, value: &mut Value, transformable: bool) {
        match value {
            Value::String(s) if transformable => self.scrub_in_place(s),
            Value::Array(items) => {
                for item in items {
                    self.scrub_value(item, transformable);
                }
            }
            Value::Object(map) => self.scrub_map(map),
            _ => {}
        }
    }

    fn scrub_map(&self, map: &mut Map<String, Value>) {
        for (key, value) in map.iter_mut() {
            let transformable = TRANSFORMABLE_PROPERTIES.contains(&key.as_str());
            self.scrub_value(value, transformable);
        }
    }
}

/// Rewrites the user-data fields of a payload.
pub trait Scrub {
    fn scrub(&mut self, scrubber: &Scrubber);
}

impl Scrub for StartupPayload {
    fn scrub(&mut self, scrubber: &Scrubber) {
        scrubber.scrub_in_place(&mut self.install_path);
        for value in self.settings.values_mut() {
            scrubber.scrub_value(value, false);
        }
    }
}

impl Scrub for ErrorPayload {
    fn scrub(&mut self, scrubber: &Scrubber) {
        scrubber.scrub_in_place(&mut self.message);
        if let Some(stack) = self.stack.as_mut() {
            scrubber.scrub_in_place(stack);
        }
        if let Some(command) = self.command.as_mut() {
            scrubber.scrub_in_place(command);
        }
    }
}

impl Scrub for Payload {
    fn scrub(&mut self, scrubber: &Scrubber) {
        match self {
            Payload::Startup(startup) => startup.scrub(scrubber),
            Payload::Error(error) => error.scrub(scrubber),
            Payload::Custom(properties) => scrubber.scrub_map(properties),
            // Counters, durations and pseudonymous ids carry no user data
            Payload::Close(_) | Payload::WorkspaceChange(_) | Payload::FeatureObserved(_) => {}
        }
    }
}
