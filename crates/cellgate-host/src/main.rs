use anyhow::{Context, Result};
use cellgate_host::cli::{Cli, Command, ServeArgs};
use cellgate_host::daemon::{KernelDaemon, KernelStatus};
use cellgate_host::http::{self, HttpState};
use cellgate_host::kernel::ProcessLauncher;
use clap::Parser;
use tokio::sync::{broadcast, mpsc, watch};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    setup_logging();

    match cli.command {
        Command::Serve(args) => serve(&args).await,
    }
}

async fn serve(args: &ServeArgs) -> Result<()> {
    let host_config = args.host_config();
    let http_config = args.http_config();

    let (control_tx, control_rx) = mpsc::channel(128);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (status_tx, status_rx) = watch::channel(KernelStatus::starting());

    // Handle Ctrl-C and SIGTERM for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                #[cfg(unix)]
                if let Some(ref mut t) = term { t.recv().await; }
                #[cfg(not(unix))]
                std::future::pending::<()>().await;
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_tx_clone.send(());
    });

    tracing::info!(argv = ?host_config.kernel.spec.argv, "starting kernel");
    let launcher = ProcessLauncher::new(host_config.kernel.clone());
    let mut daemon = KernelDaemon::start(
        Box::new(launcher),
        control_rx,
        shutdown_rx,
        status_tx,
        host_config.shutdown_grace,
    )
    .await
    .context("start kernel")?;

    let bind = http_config.bind;
    let docs = http_config.docs;
    let state = HttpState::new(control_tx, status_rx, shutdown_tx);
    let http_handle = http::spawn_http_server(http_config, state);
    if docs {
        tracing::info!(
            "HTTP docs available at http://{}/api/docs/ (OpenAPI: /api/openapi.json)",
            bind
        );
    }

    daemon.run().await?;
    let _ = http_handle.await;
    Ok(())
}

/// Set up tracing subscriber; `RUST_LOG` overrides the default `info` level.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
