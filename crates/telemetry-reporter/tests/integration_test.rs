// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use telemetry_reporter::{
    cache::BatchCache,
    config::ReporterConfig,
    constants::{MAX_RETRY_ON_CLOSE, STARTUP_ENDPOINT, STARTUP_EVENT},
    event::{Event, Payload, StartupPayload},
    identity::Identity,
    reporter::{Lifecycle, ReporterHandle, ReporterService},
    store::{InMemoryStore, JsonFileStore, KeyValueStore},
    transport::Transport,
};
use tokio::time::{sleep, timeout, Duration};

fn config(base_url: &str, overrides: &[(&str, &str)]) -> ReporterConfig {
    let mut vars: BTreeMap<String, String> = overrides
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    vars.insert("TELEMETRY_BASE_URL".to_string(), base_url.to_string());
    vars.insert("TELEMETRY_JITTER_FACTOR".to_string(), "0".to_string());
    ReporterConfig::from_lookup(|name| vars.get(name).cloned()).expect("invalid config")
}

fn start(config: &ReporterConfig, store: Arc<dyn KeyValueStore>) -> ReporterHandle {
    let cache = Arc::new(BatchCache::new(store, config.identity_cache_ceiling));
    let (service, handle) = ReporterService::new(
        config.retry,
        Transport::from_config(config),
        cache,
        Identity::new("install-1", "session-1"),
    );
    tokio::spawn(service.run());
    handle
}

fn custom(handle: &ReporterHandle, detail: &str) -> Event {
    let Value::Object(properties) = json!({ "detail": detail }) else {
        unreachable!()
    };
    Event::new("custom", "/custom", Payload::Custom(properties), handle.identity())
}

fn startup(handle: &ReporterHandle) -> Event {
    Event::new(
        STARTUP_EVENT,
        STARTUP_ENDPOINT,
        Payload::Startup(StartupPayload {
            app_version: "2.4.0".to_string(),
            platform: "linux".to_string(),
            arch: "x86_64".to_string(),
            install_path: "/opt/app".to_string(),
            settings: BTreeMap::new(),
        }),
        handle.identity(),
    )
}

async fn wait_until_closed(handle: &ReporterHandle) {
    timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = handle.snapshot().await.expect("reporter stopped");
            if snapshot.lifecycle == Lifecycle::Closed {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("close drain did not finish");
}

#[tokio::test]
async fn reporter_ships_events_and_close() {
    let mut server = Server::new_async().await;
    let custom_mock = server
        .mock("POST", "/telemetry/v1/custom")
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "installationId": "install-1",
            "sessionId": "session-1",
        })))
        .with_status(202)
        .expect(2)
        .create_async()
        .await;
    let close_mock = server
        .mock("POST", "/telemetry/v1/close")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = config(&server.url(), &[("TELEMETRY_BASE_CAPACITY", "2")]);
    let handle = start(&config, Arc::new(InMemoryStore::new()));

    handle.add_event_to_queue(custom(&handle, "first"));
    handle.add_event_to_queue(custom(&handle, "second"));
    assert!(handle.snapshot().await.unwrap().queued.is_empty());

    handle.close_event().await;
    custom_mock.assert_async().await;
    close_mock.assert_async().await;
    assert_eq!(handle.snapshot().await.unwrap().lifecycle, Lifecycle::Closed);
}

#[tokio::test]
async fn reporter_redacts_configured_literals() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/telemetry/v1/custom")
        .match_body(Matcher::PartialJson(json!({
            "detail": "opened <REDACTED>/notes.txt",
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = config(
        &server.url(),
        &[
            ("TELEMETRY_BASE_CAPACITY", "1"),
            ("TELEMETRY_REDACT", "/srv/private-user"),
        ],
    );
    let handle = start(&config, Arc::new(InMemoryStore::new()));

    handle.add_event_to_queue(custom(&handle, "opened /srv/private-user/notes.txt"));
    handle.snapshot().await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn reporter_drops_client_errors() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/telemetry/v1/custom")
        .with_status(400)
        .expect(1)
        .create_async()
        .await;

    let config = config(&server.url(), &[("TELEMETRY_BASE_CAPACITY", "1")]);
    let handle = start(&config, Arc::new(InMemoryStore::new()));

    handle.add_event_to_queue(custom(&handle, "rejected"));
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.queued.is_empty());
    assert_eq!(snapshot.retry_state.queue_capacity, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn reporter_close_drain_gives_up_on_server_errors() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/telemetry/v1/close")
        .with_status(500)
        .with_body("Internal Server Error")
        .expect(1 + MAX_RETRY_ON_CLOSE as usize)
        .create_async()
        .await;

    let config = config(
        &server.url(),
        &[
            ("TELEMETRY_BASE_TIMER_MS", "10"),
            ("TELEMETRY_MAX_DELAY_MS", "20"),
        ],
    );
    let handle = start(&config, Arc::new(InMemoryStore::new()));

    handle.close_event().await;
    wait_until_closed(&handle).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.queued.is_empty());
    assert!(!snapshot.timer_armed);
    mock.assert_async().await;
}

#[tokio::test]
async fn startup_is_not_resent_after_restart() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/telemetry/v1/startup")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("telemetry-cache.json");
    let config = config(&server.url(), &[("TELEMETRY_BASE_CAPACITY", "1")]);

    let first = start(&config, Arc::new(JsonFileStore::open(&path).unwrap()));
    first.start_event(startup(&first));
    first.snapshot().await.unwrap();
    first.shutdown();

    let second = start(&config, Arc::new(JsonFileStore::open(&path).unwrap()));
    second.start_event(startup(&second));
    assert!(second.snapshot().await.unwrap().queued.is_empty());

    mock.assert_async().await;
}

#[tokio::test]
async fn reporter_without_collector_is_inert() {
    let config = ReporterConfig::from_lookup(|name| match name {
        "TELEMETRY_BASE_CAPACITY" => Some("1".to_string()),
        _ => None,
    })
    .unwrap();
    assert!(!config.is_active());

    let handle = start(&config, Arc::new(InMemoryStore::new()));
    let mut properties = Map::new();
    properties.insert("message".to_string(), json!("never sent"));
    handle.add_event_to_queue(Event::new(
        "custom",
        "/custom",
        Payload::Custom(properties),
        handle.identity(),
    ));
    handle.close_event().await;

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.queued.is_empty());
    assert_eq!(snapshot.lifecycle, Lifecycle::Closed);
}
