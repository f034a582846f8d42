// Main entry point for the queue server

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::broker::Broker;
use server_core::kernel::ServerKernel;
use server_core::server::app::{build_app_with_state, AppState};
use server_core::render::RenderService;
use server_core::{tasks, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting playbook queue server");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let port = config.port;
    let kernel = Arc::new(ServerKernel::new(pool, config)?);
    let broker = Broker::new(Arc::clone(&kernel));
    let render = Arc::new(RenderService::new(Arc::clone(&kernel)));

    let shutdown = CancellationToken::new();
    tokio::spawn(tasks::run_reaper(
        Arc::clone(&kernel),
        Arc::clone(&broker),
        shutdown.clone(),
    ));

    let app = build_app_with_state(AppState {
        kernel,
        broker,
        render,
    });

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    shutdown.cancel();
    Ok(())
}
