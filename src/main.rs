//! marketsync - stream market prices with offline fallback.
//!
//! Connects to the configured feed, logs prices, alerts and connectivity
//! changes, and keeps the local cache warm until interrupted. Extra
//! command-line arguments are subscribed as symbols.

use anyhow::Context;
use async_trait::async_trait;
use marketsync::{
    Config, FileStore, OperationExecutor, PendingOperation, SyncEvent, SyncService, Topic,
};
use std::sync::Arc;
use tokio::signal;

/// Placeholder executor for the standalone binary.
///
/// Without a REST backend nothing can be confirmed, so every replay fails
/// and operations stay queued for a host that supplies a real executor.
struct UnconfiguredExecutor;

#[async_trait]
impl OperationExecutor for UnconfiguredExecutor {
    async fn execute(&self, operation: &PendingOperation) -> marketsync::Result<()> {
        tracing::warn!(id = %operation.id, op_type = %operation.op_type, "No executor configured, keeping operation queued");
        Err(marketsync::Error::execution("no executor configured"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = Config::load_or_default().context("loading configuration")?;
    let _log_guard = marketsync::logging::init(&config.logging)?;

    let data_dir = config.storage.resolve_data_dir()?;
    let store = FileStore::open(&data_dir)
        .await
        .with_context(|| format!("opening store at {}", data_dir.display()))?;
    tracing::info!(data_dir = %data_dir.display(), feed = %config.feed.url, "Starting marketsync");

    let service = SyncService::new(config, Arc::new(store), Arc::new(UnconfiguredExecutor));
    let _subscriptions = log_events(&service);

    let symbols: Vec<String> = std::env::args().skip(1).collect();
    service.subscribe_symbols(symbols);
    service.init().await?;

    let view = service.prices_with_fallback().await;
    tracing::info!(
        source = ?view.source,
        freshness = %view.freshness,
        symbols = view.prices.len(),
        "Initial price view"
    );

    signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("Received Ctrl+C, shutting down");
    service.dispose().await;
    Ok(())
}

fn log_events(service: &SyncService) -> Vec<marketsync::Subscription> {
    let bus = service.events();
    Topic::ALL
        .into_iter()
        .map(|topic| {
            bus.subscribe(topic, |event| match event {
                SyncEvent::Connection(status) => {
                    tracing::info!(state = %status.state, connected = status.connected, "Connection")
                }
                SyncEvent::Prices(prices) => tracing::info!(symbols = prices.len(), "Price snapshot"),
                SyncEvent::PriceUpdate(update) => {
                    tracing::info!(symbol = %update.symbol, price = %update.price, "Price update")
                }
                SyncEvent::Alert(alert) => {
                    tracing::warn!(message = alert.message().unwrap_or("<no message>"), "Alert")
                }
                SyncEvent::Network(change) => tracing::info!(online = change.is_online, "Network"),
                SyncEvent::OperationDropped(op) => {
                    tracing::error!(id = %op.id, op_type = %op.op_type, attempts = op.attempts, "Operation dropped")
                }
            })
        })
        .collect()
}
