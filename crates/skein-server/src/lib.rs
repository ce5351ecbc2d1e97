//! Skein Server
//!
//! Self-hosted HTTP surface for the coordination kernel: run leases, the
//! task scheduler and live state-sync channels.
//! This is a library crate; the server is started via `start_server()`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, http::Method, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use skein_core::hooks::install_default_hooks;
use skein_core::scheduler::{
    publish_task_events, JsonFileTaskStore, SchedulerOptions, TaskLifecycleEvent, TaskStore,
};
use skein_core::storage::CredentialStore;
use skein_core::{
    AgentRunCoordinator, EventBus, HookRegistry, KernelConfig, RunLease, StateSyncService,
    TaskScheduler,
};

pub mod background;
pub mod error;
pub mod routes;

/// Configuration for starting the server.
pub struct ServerConfig {
    /// Port to listen on (default: 3000).
    pub port: u16,
    /// Kernel config file; `~/.skein/config.toml` when unset.
    pub config_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            config_path: None,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: AgentRunCoordinator,
    pub scheduler: Arc<TaskScheduler>,
    pub sync: StateSyncService,
    pub hooks: HookRegistry,
    /// Task lifecycle notifications, mirrored onto the `tasks` channel.
    pub task_events: Arc<EventBus<TaskLifecycleEvent>>,
    /// Run leases handed out over HTTP, keyed by run id.
    pub run_leases: Arc<RwLock<HashMap<String, RunLease>>>,
    pub config: Arc<KernelConfig>,
}

impl AppState {
    /// Wire the kernel services together. `secrets` feeds the redaction hooks.
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn TaskStore>,
        secrets: &HashMap<String, String>,
    ) -> Self {
        let sync = StateSyncService::from_config(&config.state_sync);
        let hooks = HookRegistry::new();
        let registrations = install_default_hooks(&hooks, secrets, &sync);
        tracing::debug!("Installed {} default hook handlers", registrations.len());

        let task_events = Arc::new(EventBus::new());
        publish_task_events(&task_events, &sync);

        let scheduler = Arc::new(TaskScheduler::new(
            store,
            SchedulerOptions::from(&config.scheduler),
        ));

        Self {
            coordinator: AgentRunCoordinator::new(),
            scheduler,
            sync,
            hooks,
            task_events,
            run_leases: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Skein server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let kernel = match &config.config_path {
        Some(path) => KernelConfig::load_from_path(path)?,
        None => KernelConfig::load()?,
    };

    let credentials = CredentialStore::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load credentials, secret masking limited to patterns: {}", e);
        CredentialStore::default()
    });

    let store_path = kernel.scheduler.store_path();
    tracing::info!("Task store at {}", store_path.display());
    let store: Arc<dyn TaskStore> = Arc::new(JsonFileTaskStore::new(store_path));

    let state = AppState::new(kernel, store, credentials.secrets());
    let background = background::spawn(&state);
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    tracing::info!("Skein server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_agents: state.coordinator.active_keys().len(),
        channels: state.sync.list_channels().len(),
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    active_agents: usize,
    channels: usize,
}
