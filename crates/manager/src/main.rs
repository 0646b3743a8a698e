use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use arcor_catalog::BuildClient;
use arcor_domain::config::Config;
use arcor_domain::error::ConfigSeverity;
use arcor_manager::clients::ClientHub;
use arcor_manager::packages::PackageStore;
use arcor_manager::run::RunSupervisor;
use arcor_manager::state::AppState;
use arcor_manager::ws::manager_ws;

/// ARCOR2 execution manager.
#[derive(Debug, Parser)]
#[command(name = "armanager", version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    for issue in config.validate() {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => anyhow::bail!("config: {issue}"),
        }
    }

    let project_path = config
        .execution
        .project_path
        .clone()
        .context("ARCOR2_PROJECT_PATH is not set")?;
    let packages_dir = config
        .execution
        .packages_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("packages"));

    let hub = Arc::new(ClientHub::new(config.execution.peer_queue));
    let store = Arc::new(PackageStore::new(packages_dir).context("opening package store")?);
    let build = BuildClient::new(&config.services).context("creating build client")?;
    let supervisor = Arc::new(RunSupervisor::new(
        &config.execution,
        project_path.clone(),
        hub.clone(),
        store.clone(),
        build,
    ));

    let state = AppState {
        hub,
        store,
        supervisor,
    };

    let app = axum::Router::new()
        .route("/", get(manager_ws))
        .route("/ws", get(manager_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.execution.host, config.execution.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        addr,
        project_path = %project_path.display(),
        "execution manager listening"
    );
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,arcor_manager=debug")),
        )
        .init();
}
