use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use medved::config::{Cli, NodeConfig};
use medved::node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Use JSON logs in production (MEDVED_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("MEDVED_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("medved=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = NodeConfig::load(&cli.cfg).with_context(|| format!("loading {}", cli.cfg.display()))?;
    if let Some(level) = &cli.log_level {
        tracing::warn!(%level, "--log-level override is applied to the process filter only, not re-parsed into config.log_level");
    }
    tracing::info!(listen = %config.server.listen, storage = %config.storage.path.display(), "starting medved node");

    let cancel = CancellationToken::new();
    spawn_shutdown_signal_handler(cancel.clone());

    let node = Node::start(config, cancel.clone()).await.context("starting node")?;
    node.run().await;
    Ok(())
}

/// SIGINT, SIGTERM, and SIGQUIT all trigger the same graceful shutdown path.
fn spawn_shutdown_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
                _ = quit.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}
