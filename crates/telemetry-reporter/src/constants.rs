// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Number of escalations each backoff path may take before holding steady.
pub const MAX_RETRIES: u32 = 5;

/// Queue size that triggers an out-of-band send cycle when nothing is failing.
pub const BASE_QUEUE_CAPACITY: usize = 20;

/// Ceiling for the admission threshold under sustained overflow.
pub const MAX_QUEUE_CAPACITY: usize = 640;

/// Delay between two scheduled send cycles when nothing is failing.
pub const BASE_TIMER_MS: u64 = 60_000;

/// Ceiling for the scheduled delay before jitter is applied.
pub const MAX_DELAY_MS: u64 = 30 * 60_000;

pub const BACKOFF_FACTOR: f64 = 2.0;

pub const JITTER_FACTOR: f64 = 0.1;

/// Extra send cycles allowed after a close event before the queue is dropped.
pub const MAX_RETRY_ON_CLOSE: u32 = 5;

/// Identity cache entries kept before the least recently used half is evicted.
pub const IDENTITY_CACHE_CEILING: usize = 5000;

/// Per-request timeout for the HTTP transport.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_BASE_ENDPOINT: &str = "/telemetry";

pub const DEFAULT_API_VERSION: &str = "/v1";

/// Substituted for every sensitive literal found in a transformable field.
pub const REDACTION_TOKEN: &str = "<REDACTED>";

/// Status recorded when the request never produced an HTTP response.
pub const NETWORK_FAILURE_STATUS: i32 = 0;

/// Status recorded when the payload could not be encoded. Never retried.
pub const PAYLOAD_FAILURE_STATUS: i32 = -1;

// Event names produced by the reporter itself.
pub const STARTUP_EVENT: &str = "startup";
pub const CLOSE_EVENT: &str = "close";

pub const STARTUP_ENDPOINT: &str = "/startup";
pub const CLOSE_ENDPOINT: &str = "/close";
