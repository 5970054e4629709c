mod admission;
mod broadcaster;
mod config;
mod engine;
mod error;
mod gateway;
mod handlers;
mod health;
mod logging;
mod metrics;
mod registry;
mod session;
mod state;
mod status;
mod system;

use crate::config::load_config;
use crate::engine::ClaudeCliEngine;
use crate::logging::init_logging;
use crate::registry::ProjectRegistry;
use crate::state::HubState;
use crate::system::ProcSampler;
use aoc_remote_storage::ProjectStore;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match ProjectStore::open(config.projects_dir()) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "store_open_failed", error = %err, dir = %config.projects_dir().display());
            return;
        }
    };
    let registry = match ProjectRegistry::load(store, config.rotation, config.max_projects).await {
        Ok(value) => Arc::new(value),
        Err(err) => {
            error!(event = "registry_load_failed", error = %err);
            return;
        }
    };

    let engine = Arc::new(ClaudeCliEngine::new(config.claude_bin.clone()));
    let sampler = Arc::new(ProcSampler::new(config.data_dir.clone()));
    let hub = HubState::new(config.clone(), registry.clone(), engine, sampler);
    let stats_task = hub.clone().spawn_stats_task(hub.subscribe_shutdown());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };
    info!(
        event = "hub_start",
        addr = %config.addr,
        data_dir = %config.data_dir.display(),
        projects = registry.len().await
    );

    let signal_hub = hub.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!(event = "shutdown_requested");
        signal_hub.begin_shutdown();
    });

    let app = gateway::router(hub.clone());
    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(gateway::shutdown_signal(hub.subscribe_shutdown()))
    .await
    {
        error!(event = "hub_error", error = %err);
        hub.begin_shutdown();
    }

    if hub.drain(config.shutdown_grace).await {
        info!(event = "hub_drained");
    } else {
        warn!(
            event = "shutdown_grace_elapsed",
            connections = hub.admission.active(),
            executions = hub.work.active()
        );
    }
    let _ = stats_task.await;
    registry.close_all().await;
    info!(event = "hub_stop", uptime_secs = hub.uptime().as_secs());
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
