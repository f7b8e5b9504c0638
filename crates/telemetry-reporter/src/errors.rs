// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types used at the edges of the pipeline.
//!
//! None of these reach producers: the reporter logs them and keeps going.

/// Rejected configuration values
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {name}: {value}")]
    Unparseable { name: &'static str, value: String },
}

/// Failures of the durable key/value store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Why a single event could not be shipped
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    #[error("Failed to encode payload: {0}")]
    Payload(String),

    #[error("Failed to reach destination: {0}")]
    Destination(String),
}
