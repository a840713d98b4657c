use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunnelport_daemon::{
    api::{self, AppState},
    config::Cli,
    db::{self, Store},
    tasks::BackgroundTasks,
    PortManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "tunnelport_daemon=debug,tunnelportd=debug"
    } else {
        "tunnelport_daemon=info,tunnelportd=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.into_config().context("invalid configuration")?;

    tracing::info!(path = %config.db_path.display(), "using database");
    let store = Store::open(&config.db_path).context("failed to initialize database")?;

    let active = store.call(|conn| db::list_active(conn)).await?;
    if !active.is_empty() {
        tracing::info!(count = active.len(), "loaded existing allocation(s)");
    }
    tracing::info!(
        range = %config.range,
        inactivity_days = config.inactivity_window.num_days(),
        reap_at = %config.reap_at,
        self_heal = config.heartbeat.self_heal,
        "allocation policy"
    );

    let manager = Arc::new(PortManager::new(
        store.clone(),
        config.range,
        config.heartbeat,
        config.retry,
    ));
    let state = AppState {
        manager,
        probe_report: Default::default(),
    };
    let tasks = BackgroundTasks::start(store, &config, state.probe_report.clone());

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(addr = %config.listen, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    tasks.shutdown().await;
    Ok(())
}
