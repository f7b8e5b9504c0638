// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch posting and per-event outcome classification.
//!
//! Every event of a batch is sent concurrently and receives exactly one
//! [`Outcome`]. Sends that never produced an HTTP status are encoded with the
//! sentinels [`NETWORK_FAILURE_STATUS`] and [`PAYLOAD_FAILURE_STATUS`].

use crate::config::{ApiDescriptor, ReporterConfig};
use crate::constants::{NETWORK_FAILURE_STATUS, PAYLOAD_FAILURE_STATUS};
use crate::errors::ShippingError;
use crate::event::Event;
use crate::scrub::{Scrub, Scrubber};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use tracing::{debug, error};

/// Sends one event and reports the HTTP status it got back.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, event: &Event) -> Result<u16, ShippingError>;
}

fn build_client(config: &ReporterConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if let Some(https_uri) = &config.https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(https_uri.as_str())?);
    }
    builder.build()
}

/// HTTP client honouring the configured timeout and HTTPS proxy.
pub fn get_client(config: &ReporterConfig) -> reqwest::Client {
    match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "TELEMETRY | Unable to build HTTP client: {}, falling back to defaults",
                e
            );
            reqwest::Client::new()
        }
    }
}

/// Posts JSON bodies to `base_url + base_endpoint + version + endpoint`.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    api: ApiDescriptor,
}

impl HttpSender {
    #[must_use]
    pub fn new(client: reqwest::Client, api: ApiDescriptor) -> Self {
        Self { client, api }
    }
}

#[async_trait]
impl EventSender for HttpSender {
    async fn send(&self, event: &Event) -> Result<u16, ShippingError> {
        let Some(url) = self.api.url_for(event.endpoint()) else {
            return Err(ShippingError::Destination(
                "no collector configured".to_string(),
            ));
        };
        let body = event
            .body()
            .and_then(|body| serde_json::to_vec(&body))
            .map_err(|e| ShippingError::Payload(e.to_string()))?;

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ShippingError::Destination(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Status observed for one event of a batch.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// HTTP status, or a sentinel `<= 0` when no response was received
    pub status: i32,
    pub event: Event,
}

impl Outcome {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        is_retryable(self.status)
    }
}

/// Batch split by outcome.
#[derive(Debug, Default)]
pub struct PostResponse {
    pub success: Vec<Outcome>,
    pub failures: Vec<Outcome>,
}

#[must_use]
pub fn is_success(status: i32) -> bool {
    (1..=399).contains(&status)
}

/// Network failures, throttling and server errors are worth another attempt.
/// Other client errors and unencodable payloads are not.
#[must_use]
pub fn is_retryable(status: i32) -> bool {
    status == NETWORK_FAILURE_STATUS || status == 429 || (500..=599).contains(&status)
}

fn status_of(result: Result<u16, ShippingError>) -> i32 {
    match result {
        Ok(status) => i32::from(status),
        Err(ShippingError::Payload(e)) => {
            debug!("TELEMETRY | Dropping event with unencodable payload: {}", e);
            PAYLOAD_FAILURE_STATUS
        }
        Err(ShippingError::Destination(e)) => {
            debug!("TELEMETRY | Failed to send event: {}", e);
            NETWORK_FAILURE_STATUS
        }
    }
}

/// Scrubs and posts batches through an [`EventSender`].
///
/// Without a sender the transport is inert: every post succeeds trivially and
/// returns no outcomes.
#[derive(Clone)]
pub struct Transport {
    sender: Option<Arc<dyn EventSender>>,
    scrubber: Arc<Scrubber>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("inert", &self.sender.is_none())
            .field("scrubber", &self.scrubber)
            .finish()
    }
}

impl Transport {
    /// HTTP transport for an active configuration, inert otherwise.
    #[must_use]
    pub fn from_config(config: &ReporterConfig) -> Self {
        let scrubber = Scrubber::from_environment(&config.sensitive_literals);
        if !config.is_active() {
            debug!("TELEMETRY | No collector configured or telemetry disabled, posting is a no-op");
            return Self::inert(scrubber);
        }
        let sender = HttpSender::new(get_client(config), config.api.clone());
        Self::new(Arc::new(sender), scrubber)
    }

    #[must_use]
    pub fn new(sender: Arc<dyn EventSender>, scrubber: Scrubber) -> Self {
        Self {
            sender: Some(sender),
            scrubber: Arc::new(scrubber),
        }
    }

    #[must_use]
    pub fn inert(scrubber: Scrubber) -> Self {
        Self {
            sender: None,
            scrubber: Arc::new(scrubber),
        }
    }

    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.sender.is_none()
    }

    /// Sends every event once, concurrently, and partitions the outcomes.
    pub async fn post(&self, mut events: Vec<Event>) -> PostResponse {
        let Some(sender) = &self.sender else {
            return PostResponse::default();
        };

        for event in events.iter_mut().filter(|event| !event.is_scrubbed()) {
            event.payload_mut().scrub(&self.scrubber);
            event.mark_scrubbed();
        }

        let results = join_all(events.iter().map(|event| sender.send(event))).await;

        let mut response = PostResponse::default();
        for (event, result) in events.into_iter().zip(results) {
            let status = status_of(result);
            let outcome = Outcome { status, event };
            if is_success(status) {
                response.success.push(outcome);
            } else {
                debug!(
                    "TELEMETRY | Event {} failed with status {}",
                    outcome.event.name(),
                    status
                );
                response.failures.push(outcome);
            }
        }
        debug!(
            "TELEMETRY | Posted batch: {} succeeded, {} failed",
            response.success.len(),
            response.failures.len()
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorPayload, Payload};
    use crate::identity::Identity;
    use mockito::{Matcher, Server};
    use serde_json::{json, Map};

    fn event(endpoint: &str, message: &str) -> Event {
        Event::new(
            "error",
            endpoint,
            Payload::Error(ErrorPayload {
                message: message.to_string(),
                stack: None,
                command: None,
            }),
            &Identity::new("install", "session"),
        )
    }

    fn transport_for(url: String) -> Transport {
        let config = ReporterConfig {
            api: ApiDescriptor::new(url),
            ..Default::default()
        };
        Transport::new(
            Arc::new(HttpSender::new(get_client(&config), config.api.clone())),
            Scrubber::new(["alice"]),
        )
    }

    #[test]
    fn test_status_classification() {
        assert!(is_success(200));
        assert!(is_success(302));
        assert!(!is_success(0));
        assert!(!is_success(-1));
        assert!(!is_success(400));

        assert!(is_retryable(0));
        assert!(is_retryable(429));
        assert!(is_retryable(500));
        assert!(is_retryable(503));
        assert!(!is_retryable(-1));
        assert!(!is_retryable(400));
        assert!(!is_retryable(404));
    }

    #[tokio::test]
    async fn test_post_partitions_by_status() {
        let mut server = Server::new_async().await;
        let accepted = server
            .mock("POST", "/telemetry/v1/ok")
            .match_header("Content-Type", "application/json")
            .with_status(202)
            .create_async()
            .await;
        let rejected = server
            .mock("POST", "/telemetry/v1/bad")
            .with_status(400)
            .create_async()
            .await;
        let unavailable = server
            .mock("POST", "/telemetry/v1/busy")
            .with_status(503)
            .create_async()
            .await;

        let transport = transport_for(server.url());
        let response = transport
            .post(vec![
                event("/ok", "a"),
                event("/bad", "b"),
                event("/busy", "c"),
            ])
            .await;

        accepted.assert_async().await;
        rejected.assert_async().await;
        unavailable.assert_async().await;

        assert_eq!(response.success.len(), 1);
        assert_eq!(response.success[0].status, 202);
        let mut statuses: Vec<i32> = response.failures.iter().map(|o| o.status).collect();
        statuses.sort_unstable();
        assert_eq!(statuses, vec![400, 503]);
        for outcome in &response.failures {
            assert_eq!(outcome.is_retryable(), outcome.status == 503);
        }
    }

    #[tokio::test]
    async fn test_post_sends_scrubbed_body_with_identity() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/telemetry/v1/error")
            .match_body(Matcher::Json(json!({
                "message": "<REDACTED> failed",
                "stack": null,
                "command": null,
                "installationId": "install",
                "sessionId": "session",
            })))
            .with_status(200)
            .create_async()
            .await;

        let response = transport_for(server.url())
            .post(vec![event("/error", "alice failed")])
            .await;

        mock.assert_async().await;
        assert_eq!(response.success.len(), 1);
        assert!(response.failures.is_empty());
    }

    #[tokio::test]
    async fn test_retried_events_are_not_scrubbed_twice() {
        let mut server = Server::new_async().await;
        // A second pass would turn the token into "<REDACTE<REDACTED>"
        let mock = server
            .mock("POST", "/telemetry/v1/error")
            .match_body(Matcher::PartialJson(json!({"message": "<REDACTED> failed"})))
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let config = ReporterConfig {
            api: ApiDescriptor::new(server.url()),
            ..Default::default()
        };
        let transport = Transport::new(
            Arc::new(HttpSender::new(get_client(&config), config.api.clone())),
            Scrubber::new(["alice", "D> failed"]),
        );

        let first = transport.post(vec![event("/error", "alice failed")]).await;
        let retried: Vec<Event> = first.failures.into_iter().map(|o| o.event).collect();
        let second = transport.post(retried).await;

        mock.assert_async().await;
        assert_eq!(second.failures.len(), 1);
        assert_eq!(
            second.failures[0].event.payload(),
            &Payload::Error(ErrorPayload {
                message: "<REDACTED> failed".to_string(),
                stack: None,
                command: None,
            })
        );
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_network_failure() {
        // Nothing listens on the discard port
        let transport = transport_for("http://127.0.0.1:9".to_string());
        let response = transport
            .post(vec![event("/error", "a"), event("/error", "b")])
            .await;

        assert!(response.success.is_empty());
        assert_eq!(response.failures.len(), 2);
        assert!(response
            .failures
            .iter()
            .all(|o| o.status == NETWORK_FAILURE_STATUS && o.is_retryable()));
    }

    #[tokio::test]
    async fn test_inert_transport_returns_nothing() {
        let transport = Transport::inert(Scrubber::new(Vec::<String>::new()));
        assert!(transport.is_inert());
        let custom = Event::new(
            "custom",
            "/custom",
            Payload::Custom(Map::new()),
            &Identity::new("install", "session"),
        );
        let response = transport.post(vec![custom]).await;
        assert!(response.success.is_empty());
        assert!(response.failures.is_empty());
    }

    #[test]
    fn test_from_config_without_base_url_is_inert() {
        let transport = Transport::from_config(&ReporterConfig::default());
        assert!(transport.is_inert());

        let disabled = ReporterConfig {
            enabled: false,
            api: ApiDescriptor::new("http://collector.invalid"),
            ..Default::default()
        };
        assert!(Transport::from_config(&disabled).is_inert());
    }
}
