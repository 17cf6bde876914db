//! yac-lsp-bridge daemon entry point.
//!
//! Claims the Unix socket (refusing to start when a daemon is already
//! listening), sets up per-daemon file logging, and runs the event loop
//! on a current-thread runtime. Exits 0 on idle timeout or a clean
//! shutdown request.

use anyhow::{Context, Result};
use yac_lsp_bridge::daemon::Daemon;
use yac_lsp_bridge::lsp::config::Languages;
use yac_lsp_bridge::paths;

fn init_logging(log_path: &std::path::Path) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match std::fs::File::create(log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let log_file = paths::log_path();
    init_logging(&log_file);

    let socket = paths::socket_path();
    let listener = paths::claim_socket(&socket).context("failed to claim daemon socket")?;
    tracing::info!("listening on {}", socket.display());

    let daemon = Daemon::new(listener, Languages::load(), log_file);
    let result = daemon.run().await;

    // Leave no stale socket behind on a clean exit.
    let _ = std::fs::remove_file(&socket);
    result
}
