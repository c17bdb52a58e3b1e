//! specstream server
//!
//! Runs agent document-generation operations and streams their output to
//! WebSocket observers, then hands finished documents to the document store.

mod api;
mod auth;
mod broadcaster;
mod classifier;
mod config;
mod connection;
mod document_store;
mod handoff;
mod launcher;
mod logging;
mod migration_runner;
mod paths;
mod persistence;
mod registry;
mod runner;
mod state;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::api_router;
use crate::auth::{auth_middleware, StaticSessionValidator};
use crate::broadcaster::Broadcaster;
use crate::classifier::HeuristicClassifier;
use crate::config::{Config, StoreBackend};
use crate::document_store::{DocumentStore, GitHubStore, MemoryStore};
use crate::handoff::PersistenceHandoff;
use crate::launcher::Launcher;
use crate::persistence::{create_persistence_channel, OutcomeLedger, PersistenceWriter};
use crate::registry::OperationRegistry;
use crate::runner::ProcessRunner;
use crate::state::{AppState, ConnectionStats};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let paths = paths::DataPaths::resolve(config.data_dir.as_deref())?;
    paths
        .ensure_dirs()
        .with_context(|| format!("creating {}", paths.root().display()))?;
    let logging = logging::init_logging(&paths.log_dir())?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths.root().display(),
        bind = %config.bind,
        store = ?config.store,
        "Starting specstream"
    );

    let db_path = paths.db_path();
    drop(migration_runner::open_database(&db_path)?);

    // Create persistence channel and spawn writer
    let (persist_tx, persist_rx) = create_persistence_channel();
    let persistence_writer = tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let store: Arc<dyn DocumentStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Github => {
            let token = config
                .github_token
                .clone()
                .context("--store github needs GITHUB_TOKEN")?;
            Arc::new(GitHubStore::new(&config.github_api, token, Duration::from_secs(30))?)
        }
    };

    let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
    let broadcaster = Arc::new(Broadcaster::new(config.queue_capacity.max(1)));
    let registry = Arc::new(
        OperationRegistry::new(config.retention(), broadcaster, terminal_tx)
            .with_persistence(persist_tx),
    );
    let sweeper = registry.spawn_sweeper(config.sweep_interval());

    let handoff = Arc::new(PersistenceHandoff::new(
        store,
        OutcomeLedger::new(db_path),
        registry.clone(),
        config.handoff(),
    ));
    let (shutdown_tx, _) = watch::channel(false);
    let handoff_worker = handoff.clone().spawn(terminal_rx, shutdown_tx.subscribe());

    let runner = ProcessRunner::new(registry.clone(), Arc::new(HeuristicClassifier));
    let validator = StaticSessionValidator::new(&config.session_tokens);
    if validator.is_open() {
        warn!(
            component = "server",
            event = "server.auth.open_mode",
            "No session tokens configured, accepting any session id"
        );
    }

    let state = Arc::new(AppState {
        registry: registry.clone(),
        launcher: Launcher::new(registry.clone(), runner, config.agent()),
        handoff,
        validator: Arc::new(validator),
        keepalive: config.keepalive(),
        connections: ConnectionStats::default(),
        shutdown: shutdown_tx,
    });

    let mut app = api_router().with_state(state.clone());
    if let Some(token) = config.auth_token.clone().filter(|t| !t.is_empty()) {
        app = app.layer(axum::middleware::from_fn_with_state(
            Arc::<str>::from(token),
            auth_middleware,
        ));
    }
    let app = app.layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %config.bind,
        "Listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    sweeper.abort();

    // The worker stops after the failure records of aborted operations land;
    // the audit writer stops once the last registry handle is gone.
    drop(registry);
    if tokio::time::timeout(Duration::from_secs(10), handoff_worker)
        .await
        .is_err()
    {
        warn!(
            component = "server",
            event = "server.shutdown.handoff_timeout",
            "Persistence handoff did not finish in time"
        );
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), persistence_writer).await;

    info!(
        component = "server",
        event = "server.stopped",
        "specstream stopped"
    );
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM, then fail running operations and tell open
/// connections to close.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(
                component = "server",
                event = "server.signal.ctrl_c_failed",
                error = %e,
                "Ctrl-C handler unavailable"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    let active = state.registry.active_ids().await;
    info!(
        component = "server",
        event = "server.shutdown",
        active_operations = active.len(),
        "Shutdown signal received"
    );

    // Nothing may stay `running` across a restart
    for operation_id in active {
        if let Err(e) = state.registry.abort(&operation_id, "server shutdown").await {
            warn!(
                component = "server",
                event = "server.shutdown.abort_failed",
                operation_id = %operation_id,
                error = %e,
                "Failed to abort operation"
            );
        }
    }
    state.shutdown.send_replace(true);
}
