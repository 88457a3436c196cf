//! `crossline` binary: load settings, start the server, stop on Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossline_server::CrosslineServer;
use crossline_settings::{load_settings_from_path, settings_path};

/// Crossline lower-peer server.
#[derive(Parser, Debug)]
#[command(name = "crossline", about = "Traffic signal control link server", version)]
struct Cli {
    /// Settings file (defaults to `~/.crossline/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.config.unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    crossline_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    if settings.auth.tokens.is_empty() {
        tracing::warn!("no auth tokens configured, every login will be rejected");
    }

    let server = CrosslineServer::new(settings);
    let (addr, handle) = server.listen().await.context("Failed to bind listener")?;
    tracing::info!("crossline listening on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    let aborted = server
        .shutdown()
        .graceful_shutdown(Some(Duration::from_secs(10)))
        .await;
    let _ = handle.await;
    tracing::info!(aborted, "shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_are_optional() {
        let cli = Cli::parse_from(["crossline"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::parse_from(["crossline", "--config", "/tmp/s.json", "--port", "7100"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.json")));
        assert_eq!(cli.port, Some(7100));
    }
}
