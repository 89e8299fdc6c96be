//! svcproxy daemon
//!
//! Runs on every node and keeps the node's nftables table in sync with the
//! cluster's services and endpoints.
//!
//! ## Architecture
//!
//! - **Feed**: reads newline-delimited watch events (stdin or a file)
//! - **Event loop**: applies events to the change trackers in order
//! - **Sync runner**: rate-limited sync passes that rebuild and apply rules

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use svcproxy_agent::backend::{MemoryBackend, NftBackend, RuleBackend};
use svcproxy_agent::config::{BackendKind, Config};
use svcproxy_agent::conntrack::ConntrackCli;
use svcproxy_agent::{events, feed, metrics, Proxier, ProxyError};
use svcproxy_reconcile::SyncRunner;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SVCPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting svcproxy");
    info!(
        hostname = %config.hostname,
        ip_family = %config.ip_family,
        backend = ?config.backend,
        table = %config.table,
        sync_period = ?config.sync_period,
        min_sync_period = ?config.min_sync_period,
        "Configuration loaded"
    );

    metrics::describe_all();

    let backend: Arc<dyn RuleBackend> = match config.backend {
        BackendKind::Nft => Arc::new(
            NftBackend::new(config.ip_family, &config.table).with_binary(&config.nft_binary),
        ),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    let conntrack = Arc::new(ConntrackCli::new(&config.conntrack_binary));

    let (runner, sync_handle) =
        SyncRunner::new(config.scheduler_config()).context("invalid sync period settings")?;

    let proxier = Arc::new(Proxier::new(
        config.proxier_config(),
        backend,
        conntrack,
        sync_handle,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Sync passes
    let runner_handle = tokio::spawn({
        let proxier = Arc::clone(&proxier);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            runner
                .run(
                    move || {
                        let proxier = Arc::clone(&proxier);
                        async move {
                            match proxier.sync_proxy_rules().await {
                                Ok(_) => {}
                                Err(ProxyError::NotInitialized) => {
                                    debug!("Skipped sync pass, waiting for initial listings")
                                }
                                Err(e) => error!(error = %e, "Sync pass failed"),
                            }
                        }
                    },
                    shutdown_rx,
                )
                .await
        }
    });

    // Event queue consumer
    let event_handle = tokio::spawn({
        let proxier = Arc::clone(&proxier);
        let shutdown_rx = shutdown_rx.clone();
        async move { events::run_event_loop(proxier, event_rx, shutdown_rx).await }
    });

    // Watch feed
    let reader = feed::open_feed(config.event_file.as_deref())
        .await
        .context("failed to open watch feed")?;
    let feed_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { feed::run_feed(reader, event_tx, shutdown_rx).await }
    });

    // End of the feed does not stop the daemon; rules stay in sync with the
    // last known state until a signal arrives.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = runner_handle => {
            error!("Sync runner exited");
        }
    }

    let _ = shutdown_tx.send(true);

    // A feed blocked on stdin never observes the signal.
    feed_handle.abort();
    if let Err(e) = event_handle.await {
        error!(error = %e, "Event loop task panicked");
    }

    info!("svcproxy shutdown complete");
    Ok(())
}
