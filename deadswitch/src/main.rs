// deadswitch - self-hosted dead man's switch
// Entry point and process setup

use anyhow::Context;
use clap::Parser;
use deadswitch::app::AppState;
use deadswitch::cli::{Cli, Commands};
use deadswitch::commands;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deadswitch=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let state = AppState::new(cli.config.to_app_config())
        .await
        .context("failed to open the data directory")?;

    match cli.command {
        Commands::Serve => serve(state).await,
        command => {
            let output = commands::execute(&state, command).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

/// Run the sweep driver until Ctrl-C, letting an in-flight sweep finish
async fn serve(state: AppState) -> anyhow::Result<()> {
    tracing::info!("Starting deadswitch sweep driver");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut driver = tokio::spawn(async move { commands::serve(&state, shutdown_rx).await });

    tokio::select! {
        finished = &mut driver => {
            finished.context("sweep driver panicked")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
            driver.await.context("sweep driver panicked")??;
        }
    }

    Ok(())
}
