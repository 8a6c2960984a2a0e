//! Ideaflow server - approval routing for submitted ideas

use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ideaflow::approval::{ApprovalEngine, IdleSweeper};
use ideaflow::clock::SystemClock;
use ideaflow::config::{Command, Config};
use ideaflow::delegation::DelegationSweeper;
use ideaflow::notify::{Dispatcher, LogNotifier, Notifier, WebhookNotifier};
use ideaflow::store::SqliteStore;
use ideaflow::{api, schedule, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ideaflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    // Database connection
    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    let store = SqliteStore::new(pool);
    store.migrate().await?;

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Delivering notifications to webhook");
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => Arc::new(LogNotifier),
    };

    let engine = Arc::new(ApprovalEngine::new(
        Arc::new(store),
        Arc::new(SystemClock),
        Dispatcher::new(notifier),
        config.engine_config(),
    ));

    match config.command() {
        Command::SweepIdle => {
            let report = IdleSweeper::new(engine).run_once().await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::SweepDelegations => {
            let report = DelegationSweeper::new(engine).run_once().await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Serve => serve(config, engine).await?,
    }

    Ok(())
}

async fn serve(config: Config, engine: Arc<ApprovalEngine>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let idle = tokio::spawn(schedule::run_idle_sweeper(
        IdleSweeper::new(engine.clone()),
        config.idle_sweep_at,
        shutdown_rx.clone(),
    ));
    let delegations = tokio::spawn(schedule::run_delegation_sweeper(
        DelegationSweeper::new(engine.clone()),
        config.delegation_sweep_interval(),
        shutdown_rx,
    ));

    // Build router
    let app = api::router(AppState::new(engine)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    // Start server
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(idle, delegations);

    Ok(())
}
