//! Ledger Server - Main entry point
//!
//! Runs the event processor against PostgreSQL until interrupted.

use clap::Parser;

use apex_ledger::{
    config::Config,
    db::Database,
    telemetry::{init_logging, init_metrics},
    Runtime,
};

#[derive(Debug, Parser)]
#[command(name = "ledger-server", version, about = "Apex Ledger projection server")]
struct Args {
    /// Configuration file (environment variables override it)
    #[arg(short, long, env = "LEDGER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    init_logging(&config.logging)?;
    init_metrics(&config.metrics, "ledger-server")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Ledger Server");

    let db = Database::new(&config.database).await?;
    if config.database.run_migrations {
        db.migrate().await?;
    }

    let runtime = Runtime::postgres(&db, config)?;
    let processor = runtime.start_processor().await?;

    shutdown_signal().await;

    tracing::info!(position = processor.position(), "Stopping event processor");
    processor.stop().await?;
    db.pool().close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
