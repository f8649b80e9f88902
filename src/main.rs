//! Caseline entry point: CLI, startup wiring, and shutdown.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use caseline::assign::AssignClient;
use caseline::auth::AuthService;
use caseline::config::AppConfig;
use caseline::db;
use caseline::gateway::server::{start_server, AppState};
use caseline::gateway::sse::FeedHub;
use caseline::storage::LocalStorage;

#[derive(Parser)]
#[command(name = "caseline", version, about = "Legal case intake and management service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway (default).
    Serve,
    /// Connect to the database, apply migrations, and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; absence is not an error.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            db::connect_from_config(&config.database)
                .await
                .context("connecting to database")?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let database = db::connect_from_config(&config.database)
        .await
        .context("connecting to database")?;
    tracing::info!(backend = config.database.backend.as_str(), "Database ready");

    let auth = AuthService::new(database.clone(), &config.auth);
    match auth.purge_expired_sessions().await {
        Ok(purged) if purged > 0 => tracing::info!(purged, "Purged expired sessions"),
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to purge expired sessions: {}", e),
    }

    let state = Arc::new(AppState {
        db: database,
        auth,
        storage: Arc::new(LocalStorage::new(config.storage.root.clone())),
        assign: AssignClient::new(config.ai.service_url.clone()),
        feed: FeedHub::new(),
        shutdown_tx: tokio::sync::RwLock::new(None),
    });

    let bound = start_server(
        config.server.bind_addr,
        state.clone(),
        &config.server.allowed_origins,
    )
    .await
    .context("starting gateway server")?;
    tracing::info!("Caseline gateway listening on http://{}", bound);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    if let Some(tx) = state.shutdown_tx.write().await.take() {
        let _ = tx.send(());
    }
    Ok(())
}
