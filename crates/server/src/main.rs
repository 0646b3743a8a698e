use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use arcor_catalog::client::{ObjectTypeBackend, ProjectBackend, SceneBackend};
use arcor_catalog::{BuildClient, CachedStore, PersistenceClient, SceneServiceClient};
use arcor_domain::config::Config;
use arcor_domain::error::ConfigSeverity;
use arcor_server::aiming::AimingTable;
use arcor_server::clients::ClientRegistry;
use arcor_server::locks::LockTable;
use arcor_server::manager_link::ManagerLink;
use arcor_server::object_types::ObjectTypeGraph;
use arcor_server::session::Session;
use arcor_server::state::AppState;
use arcor_server::ws::ui_ws;

/// ARCOR2 server: the websocket hub UI clients talk to.
#[derive(Debug, Parser)]
#[command(name = "arserver", version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Validate the configuration and exit.
    ConfigCheck,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let has_errors = issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error);
    if let Some(Command::ConfigCheck) = cli.command {
        if has_errors {
            std::process::exit(1);
        }
        println!("configuration ok");
        return Ok(());
    }
    if has_errors {
        anyhow::bail!("configuration invalid");
    }

    run_server(Arc::new(config)).await
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("ARCOR2 server starting");

    // ── catalog adapters ─────────────────────────────────────────────
    let persistence =
        PersistenceClient::new(&config.services).context("creating persistence client")?;
    let ttl = Duration::from_millis(config.catalog.listing_ttl_ms);
    let capacity = config.catalog.entity_capacity;
    let scenes = Arc::new(CachedStore::new(
        "scene",
        Arc::new(SceneBackend(persistence.clone())),
        ttl,
        capacity,
    ));
    let projects = Arc::new(CachedStore::new(
        "project",
        Arc::new(ProjectBackend(persistence.clone())),
        ttl,
        capacity,
    ));
    let object_type_store = Arc::new(CachedStore::new(
        "object type",
        Arc::new(ObjectTypeBackend(persistence.clone())),
        ttl,
        capacity,
    ));
    let scene_service =
        SceneServiceClient::new(&config.services).context("creating scene service client")?;
    let build = BuildClient::new(&config.services).context("creating build client")?;

    // ── hub state ────────────────────────────────────────────────────
    let registry = Arc::new(ClientRegistry::new(config.server.peer_queue));
    let manager = ManagerLink::new(
        &config.services.execution_url,
        registry.clone(),
        Duration::from_millis(config.services.timeout_ms * 4),
    );
    manager.spawn(CancellationToken::new());

    let state = AppState {
        config: config.clone(),
        registry,
        locks: Arc::new(LockTable::new()),
        aiming: Arc::new(AimingTable::new()),
        session: Arc::new(RwLock::new(Session::default())),
        scenes,
        projects,
        object_type_store,
        graph: Arc::new(ObjectTypeGraph::new()),
        models: Arc::new(persistence.clone()),
        scene_service: Arc::new(scene_service),
        build: Some(Arc::new(build)),
        manager: Some(manager),
    };

    // First catalog sweep; a cold catalog is not fatal, the next RPC
    // retries through the caches.
    if let Err(e) = state.refresh_object_types().await {
        tracing::warn!(error = %e, "initial object type refresh failed");
    }

    let app = axum::Router::new()
        .route("/", get(ui_ws))
        .route("/ws", get(ui_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr, "server listening");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,arcor_server=debug")),
        )
        .init();
}
