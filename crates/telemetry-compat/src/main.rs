// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{collections::BTreeMap, env, sync::Arc};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use telemetry_reporter::{
    cache::BatchCache,
    config::ReporterConfig,
    constants::{STARTUP_ENDPOINT, STARTUP_EVENT},
    event::{Event, Payload, StartupPayload, WorkspaceChangePayload},
    identity::{Identity, IdentityProvider},
    reporter::{Lifecycle, ReporterHandle, ReporterService},
    store::{InMemoryStore, JsonFileStore, KeyValueStore},
    transport::Transport,
};

const INSTALLATION_KEY: &str = "installation";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TELEMETRY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ReporterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating telemetry configuration: {e}");
            return;
        }
    };

    let store: Arc<dyn KeyValueStore> = match &config.store_path {
        Some(path) => match JsonFileStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(
                    "Unable to open telemetry cache at {}: {e}, falling back to memory",
                    path.display()
                );
                Arc::new(InMemoryStore::new())
            }
        },
        None => Arc::new(InMemoryStore::new()),
    };
    let cache = Arc::new(BatchCache::new(store, config.identity_cache_ceiling));

    let identity_provider = identity_provider(Arc::clone(&cache));
    let identity = identity_provider.get_identity().await.clone();

    let (service, handle) = ReporterService::new(
        config.retry,
        Transport::from_config(&config),
        Arc::clone(&cache),
        identity,
    );
    let service_task = tokio::spawn(service.run());

    if config.is_active() {
        info!("Telemetry enabled, reporting to {:?}", config.api.base_url);
    } else {
        info!("Telemetry inactive, events will be discarded");
    }

    handle.start_event(startup_event(&handle));
    if let Ok(workspace) = env::current_dir() {
        let workspace_id = stable_id(cache, workspace.to_string_lossy().into_owned()).await;
        handle.add_event_to_queue(Event::new(
            "workspaceChange",
            "/workspace",
            Payload::WorkspaceChange(WorkspaceChangePayload {
                workspace_id,
                file_count: 0,
                languages: Vec::new(),
            }),
            handle.identity(),
        ));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
    shutdown(&handle).await;

    if let Err(e) = service_task.await {
        error!("Telemetry reporter task failed: {e}");
    }
}

/// Installation id is kept in the identity cache so it survives restarts;
/// the session id is new for every process.
fn identity_provider(cache: Arc<BatchCache>) -> IdentityProvider {
    if let Ok(installation_id) = env::var("TELEMETRY_INSTALLATION_ID") {
        return IdentityProvider::new_from_static(Identity::new(
            installation_id,
            uuid::Uuid::new_v4().to_string(),
        ));
    }
    IdentityProvider::new_from_resolver(Arc::new(move || {
        let cache = Arc::clone(&cache);
        Box::pin(async move {
            Identity::new(
                stable_id(cache, INSTALLATION_KEY.to_string()).await,
                uuid::Uuid::new_v4().to_string(),
            )
        })
    }))
}

/// Cache lookups may hit the file store, so they run on the blocking pool.
async fn stable_id(cache: Arc<BatchCache>, volatile_id: String) -> String {
    match tokio::task::spawn_blocking(move || cache.stable_id_for(&volatile_id)).await {
        Ok(stable_id) => stable_id,
        Err(e) => {
            error!("Unable to resolve stable id: {e}");
            uuid::Uuid::new_v4().to_string()
        }
    }
}

fn startup_event(handle: &ReporterHandle) -> Event {
    let install_path = env::current_exe()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut settings = BTreeMap::new();
    settings.insert(
        "logLevel".to_string(),
        serde_json::Value::String(env::var("TELEMETRY_LOG_LEVEL").unwrap_or_default()),
    );

    Event::new(
        STARTUP_EVENT,
        STARTUP_ENDPOINT,
        Payload::Startup(StartupPayload {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            install_path,
            settings,
        }),
        handle.identity(),
    )
}

async fn shutdown(handle: &ReporterHandle) {
    info!("Shutdown requested, draining telemetry");
    handle.close_event().await;
    if let Some(snapshot) = handle.snapshot().await {
        info!(
            "Telemetry close cycle done: {} events still queued, timer armed: {}, state: {:?}",
            snapshot.queued.len(),
            snapshot.timer_armed,
            snapshot.lifecycle
        );
    }
    // Remaining retries run on the reporter's timer; stop once they settle
    // or the process is asked to exit again.
    tokio::select! {
        () = wait_for_drain(handle) => {}
        _ = tokio::signal::ctrl_c() => {
            debug!("Second shutdown signal, abandoning drain");
        }
    }
    handle.shutdown();
}

async fn wait_for_drain(handle: &ReporterHandle) {
    while let Some(snapshot) = handle.snapshot().await {
        if snapshot.lifecycle == Lifecycle::Closed {
            debug!("Telemetry drain finished");
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
