//! Composition root for the sync layer.
//!
//! [`SyncService`] wires the network monitor to the feed connection and the
//! pending-operation queue, and exposes read-with-fallback access to
//! cached data.

use crate::cache::{CacheDomain, CacheStore, CachedRead, Freshness};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::feed::{
    ConnectionManager, ConnectionSettings, ConnectionState, Connector, PriceTable, WsConnector,
};
use crate::network::{ConnectivityProbe, NetworkChange, NetworkMonitor};
use crate::queue::{DrainOutcome, OperationExecutor, PendingOperation, PendingOperationQueue};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a price view came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    /// The connected feed.
    Live,
    /// The last persisted snapshot.
    Cache,
}

/// Prices with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceView {
    /// Empty when nothing is live or cached.
    pub prices: PriceTable,
    pub source: PriceSource,
    pub freshness: Freshness,
    /// Snapshot time for cached views.
    pub stored_at: Option<DateTime<Utc>>,
}

/// Outcome of [`SyncService::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Executed immediately.
    Executed,
    /// Queued for replay; carries the operation id.
    Queued(String),
}

/// Replaceable collaborators of a [`SyncService`].
pub struct SyncParts {
    pub store: Arc<dyn KeyValueStore>,
    pub executor: Arc<dyn OperationExecutor>,
    pub connector: Arc<dyn Connector>,
    pub clock: Arc<dyn Clock>,
    pub network: Arc<NetworkMonitor>,
}

struct Inner {
    config: Config,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    network: Arc<NetworkMonitor>,
    cache: CacheStore,
    queue: PendingOperationQueue,
    connection: ConnectionManager,
    executor: Arc<dyn OperationExecutor>,
}

impl Inner {
    async fn drain_pending(&self) -> DrainOutcome {
        let outcome = self.queue.drain(self.executor.as_ref()).await;
        if let DrainOutcome::Completed(report) = &outcome {
            for dropped in &report.dropped {
                self.bus.publish(SyncEvent::OperationDropped(dropped.clone()));
            }
        }
        outcome
    }
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    network_hook: Option<Subscription>,
    /// Stops the probe and any replay started by the network hook.
    cancel: Option<CancellationToken>,
}

/// The sync layer's public face.
pub struct SyncService {
    inner: Arc<Inner>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for SyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncService")
            .field("connection", &self.inner.connection)
            .field("online", &self.inner.network.is_online())
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Create a service with the websocket transport and system clock.
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        let network = Arc::new(NetworkMonitor::new(config.network.assume_online));
        Self::with_parts(
            config,
            SyncParts {
                store,
                executor,
                connector: Arc::new(WsConnector),
                clock: Arc::new(SystemClock),
                network,
            },
        )
    }

    /// Create a service from explicit collaborators.
    pub fn with_parts(config: Config, parts: SyncParts) -> Self {
        let bus = Arc::new(EventBus::new());
        let cache = CacheStore::new(
            Arc::clone(&parts.store),
            Arc::clone(&parts.clock),
            config.cache.clone(),
        );
        let queue = PendingOperationQueue::new(
            Arc::clone(&parts.store),
            Arc::clone(&parts.clock),
            config.queue.clone(),
        );
        let connection = ConnectionManager::new(
            ConnectionSettings::from_config(&config.feed),
            parts.connector,
            Arc::clone(&bus),
            cache.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                clock: parts.clock,
                bus,
                network: parts.network,
                cache,
                queue,
                connection,
                executor: parts.executor,
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Start syncing.
    ///
    /// Loads persisted operations, subscribes the configured symbols, hooks
    /// connectivity changes and, when online, replays the queue and
    /// connects. Calling it again while running does nothing. Must be
    /// called from within a tokio runtime.
    pub async fn init(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            debug!("Sync service already initialised");
            return Ok(());
        }

        let inner = &self.inner;
        let pending = inner.queue.load().await;
        inner
            .connection
            .subscribe_to_symbols(inner.config.feed.symbols.iter().cloned());

        let cancel = CancellationToken::new();
        lifecycle.network_hook = Some(self.hook_network(cancel.clone()));

        if let Some(probe) = ConnectivityProbe::from_config(
            &inner.config.network,
            Arc::clone(&inner.network),
            cancel.child_token(),
        ) {
            tokio::spawn(probe.run());
        }
        lifecycle.cancel = Some(cancel);
        lifecycle.running = true;

        let online = inner.network.is_online();
        info!(pending, online, "Sync service started");
        if online {
            if pending > 0 {
                inner.drain_pending().await;
            }
            inner.connection.connect();
        }
        Ok(())
    }

    /// Forward connectivity changes; on reconnection start the feed and
    /// replay the queue. Nothing runs once `cancel` has fired.
    fn hook_network(&self, cancel: CancellationToken) -> Subscription {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let runtime = tokio::runtime::Handle::current();
        self.inner.network.on_change(move |change: &NetworkChange| {
            if cancel.is_cancelled() {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.bus.publish(SyncEvent::Network(*change));
            if !change.came_online() {
                return;
            }

            info!("Back online, reconnecting and replaying queued operations");
            {
                let _runtime = runtime.enter();
                inner.connection.connect();
            }
            let cancel = cancel.clone();
            runtime.spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => debug!("Replay abandoned, service stopped"),
                    _ = inner.drain_pending() => {}
                }
            });
        })
    }

    /// Stop syncing: stop background work, unhook connectivity and
    /// disconnect.
    /// Calling it when not running does nothing.
    pub async fn dispose(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return;
        }
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        if let Some(hook) = lifecycle.network_hook.take() {
            hook.unsubscribe();
        }
        self.inner.connection.disconnect();
        lifecycle.running = false;
        info!("Sync service stopped");
    }

    /// Live prices when connected, otherwise the cached snapshot.
    pub async fn prices_with_fallback(&self) -> PriceView {
        let connection = &self.inner.connection;
        if connection.state() == ConnectionState::Connected {
            let live = connection.prices();
            if !live.is_empty() {
                return PriceView {
                    prices: live,
                    source: PriceSource::Live,
                    freshness: Freshness::Fresh,
                    stored_at: None,
                };
            }
        }

        let cached = self
            .inner
            .cache
            .read_domain::<PriceTable>(CacheDomain::Prices)
            .await;
        debug!(freshness = %cached.freshness, "Serving prices from cache");
        PriceView {
            prices: cached.data.unwrap_or_default(),
            source: PriceSource::Cache,
            freshness: cached.freshness,
            stored_at: cached.stored_at,
        }
    }

    /// Cached dataset for `domain`, classified by its TTL.
    pub async fn cached<T: DeserializeOwned>(&self, domain: CacheDomain) -> CachedRead<T> {
        self.inner.cache.read_domain(domain).await
    }

    /// Persist a dataset fetched by a collaborator.
    pub async fn store<T: Serialize + ?Sized>(&self, domain: CacheDomain, data: &T) -> Result<()> {
        self.inner.cache.write_domain(domain, data).await
    }

    /// Fetch when online and cache the result; fall back to the cache when
    /// offline or when the fetch fails.
    pub async fn fetch_or_cached<T, F, Fut>(&self, domain: CacheDomain, fetch: F) -> CachedRead<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.inner.network.is_online() {
            match fetch().await {
                Ok(data) => {
                    if let Err(e) = self.inner.cache.write_domain(domain, &data).await {
                        warn!(domain = domain.key(), error = %e, "Failed to cache fetched data");
                    }
                    return CachedRead {
                        data: Some(data),
                        stored_at: Some(self.inner.clock.now()),
                        freshness: Freshness::Fresh,
                    };
                }
                Err(e) => {
                    warn!(domain = domain.key(), error = %e, "Fetch failed, serving cache");
                }
            }
        }
        self.inner.cache.read_domain(domain).await
    }

    /// Run a mutation now when online, otherwise queue it for replay.
    ///
    /// Executor errors while online are returned, not queued.
    pub async fn submit(
        &self,
        op_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Submission> {
        let op_type = op_type.into();
        if !self.inner.network.is_online() {
            let id = self.inner.queue.enqueue(op_type, payload).await?;
            info!(%id, "Offline, operation queued");
            return Ok(Submission::Queued(id));
        }

        let operation = PendingOperation {
            id: Uuid::now_v7().to_string(),
            op_type,
            payload,
            created_at: self.inner.clock.now(),
            attempts: 0,
        };
        self.inner.executor.execute(&operation).await?;
        debug!(id = %operation.id, op_type = %operation.op_type, "Operation executed");
        Ok(Submission::Executed)
    }

    /// Replay queued operations now.
    pub async fn drain_pending(&self) -> DrainOutcome {
        self.inner.drain_pending().await
    }

    /// Queued operations, oldest first.
    pub async fn pending(&self) -> Vec<PendingOperation> {
        self.inner.queue.list().await
    }

    pub fn connect(&self) {
        self.inner.connection.connect();
    }

    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    pub fn subscribe_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.connection.subscribe_to_symbols(symbols);
    }

    pub fn unsubscribe_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.connection.unsubscribe_from_symbols(symbols);
    }

    /// Feed a platform connectivity report.
    pub fn report_connectivity(&self, online: bool) -> Option<NetworkChange> {
        self.inner.network.report(online)
    }

    pub fn is_online(&self) -> bool {
        self.inner.network.is_online()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// The feed connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Event bus consumers subscribe on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::events::Topic;
    use crate::feed::LoopbackConnector;
    use crate::queue::MockOperationExecutor;
    use crate::storage::MemoryStore;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn service(
        online: bool,
        executor: MockOperationExecutor,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    ) -> SyncService {
        SyncService::with_parts(
            Config::default(),
            SyncParts {
                store,
                executor: Arc::new(executor),
                connector: Arc::new(LoopbackConnector::new()),
                clock,
                network: Arc::new(NetworkMonitor::new(online)),
            },
        )
    }

    #[tokio::test]
    async fn test_offline_submit_queues() {
        let mut executor = MockOperationExecutor::new();
        executor.expect_execute().never();
        let svc = service(
            false,
            executor,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );

        let submitted = svc.submit("place_order", json!({"qty": 1})).await.unwrap();
        let Submission::Queued(id) = submitted else {
            panic!("expected queued submission");
        };
        let pending = svc.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[tokio::test]
    async fn test_online_submit_executes_and_surfaces_errors() {
        let mut executor = MockOperationExecutor::new();
        let mut calls = 0;
        executor.expect_execute().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(Error::execution("rejected"))
            }
        });
        let svc = service(
            true,
            executor,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );

        assert_eq!(
            svc.submit("cancel_order", json!({})).await.unwrap(),
            Submission::Executed
        );
        assert!(svc.submit("cancel_order", json!({})).await.is_err());
        assert!(svc.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_price_fallback_uses_cache_when_not_connected() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let svc = service(false, MockOperationExecutor::new(), store, clock.clone());

        let empty = svc.prices_with_fallback().await;
        assert_eq!(empty.source, PriceSource::Cache);
        assert_eq!(empty.freshness, Freshness::Absent);
        assert!(empty.prices.is_empty());

        let table: PriceTable = [("BTC", dec!(50000))].into_iter().collect();
        svc.store(CacheDomain::Prices, &table).await.unwrap();

        clock.advance(TimeDelta::seconds(250));
        let view = svc.prices_with_fallback().await;
        assert_eq!(view.freshness, Freshness::Fresh);
        assert_eq!(view.prices, table);

        clock.advance(TimeDelta::seconds(150));
        let view = svc.prices_with_fallback().await;
        assert_eq!(view.freshness, Freshness::Stale);
        assert_eq!(view.prices, table);
    }

    #[tokio::test]
    async fn test_fetch_or_cached_revalidates_when_online() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let svc = service(true, MockOperationExecutor::new(), store, clock.clone());

        let fetched = svc
            .fetch_or_cached(CacheDomain::Portfolio, || async { Ok(json!({"value": 10})) })
            .await;
        assert_eq!(fetched.freshness, Freshness::Fresh);

        clock.advance(TimeDelta::seconds(600));
        let fallback = svc
            .fetch_or_cached::<serde_json::Value, _, _>(CacheDomain::Portfolio, || async {
                Err(Error::transport("503"))
            })
            .await;
        assert_eq!(fallback.freshness, Freshness::Stale);
        assert_eq!(fallback.data, Some(json!({"value": 10})));

        svc.report_connectivity(false);
        let called = std::sync::atomic::AtomicBool::new(false);
        let offline = svc
            .fetch_or_cached(CacheDomain::Portfolio, || {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok(json!({"value": 99})) }
            })
            .await;
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(offline.data, Some(json!({"value": 10})));
    }

    #[tokio::test]
    async fn test_coming_online_replays_queue_and_publishes() {
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut executor = MockOperationExecutor::new();
        executor.expect_execute().times(1).returning(move |op| {
            let _ = done_tx.send(op.op_type.clone());
            Ok(())
        });
        let svc = service(
            false,
            executor,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );
        svc.init().await.unwrap();
        svc.submit("place_order", json!({"qty": 3})).await.unwrap();

        let changes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let changes = Arc::clone(&changes);
            svc.events().subscribe(Topic::Network, move |event| {
                if let SyncEvent::Network(change) = event {
                    changes.lock().push(*change);
                }
            });
        }

        svc.report_connectivity(true);
        assert_eq!(done_rx.recv().await.as_deref(), Some("place_order"));
        assert_eq!(
            *changes.lock(),
            vec![NetworkChange {
                was_online: false,
                is_online: true
            }]
        );
        svc.dispose().await;
    }

    #[tokio::test]
    async fn test_capped_operation_publishes_drop_event() {
        let mut executor = MockOperationExecutor::new();
        executor
            .expect_execute()
            .returning(|_| Err(Error::execution("nope")));
        let config = Config {
            queue: crate::config::QueueConfig {
                max_attempts: Some(1),
            },
            ..Config::default()
        };
        let svc = SyncService::with_parts(
            config,
            SyncParts {
                store: Arc::new(MemoryStore::new()),
                executor: Arc::new(executor),
                connector: Arc::new(LoopbackConnector::new()),
                clock: Arc::new(ManualClock::default()),
                network: Arc::new(NetworkMonitor::new(false)),
            },
        );
        svc.submit("place_order", json!({})).await.unwrap();

        let dropped = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let dropped = Arc::clone(&dropped);
            svc.events().subscribe(Topic::OperationDropped, move |event| {
                if let SyncEvent::OperationDropped(op) = event {
                    dropped.lock().push(op.op_type.clone());
                }
            });
        }

        svc.drain_pending().await;
        assert_eq!(*dropped.lock(), vec!["place_order".to_string()]);
        assert!(svc.pending().await.is_empty());
    }

    /// Signals when a replay starts, then never finishes it.
    struct StalledExecutor {
        entered: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl OperationExecutor for StalledExecutor {
        async fn execute(&self, _operation: &PendingOperation) -> Result<()> {
            self.entered.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_dispose_after_reconnect_stays_disconnected() {
        let svc = service(
            false,
            MockOperationExecutor::new(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );
        svc.init().await.unwrap();

        svc.report_connectivity(true);
        assert_eq!(svc.connection_state(), ConnectionState::Connecting);
        svc.dispose().await;

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(svc.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dispose_abandons_replay_in_flight() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let svc = SyncService::with_parts(
            Config::default(),
            SyncParts {
                store: Arc::new(MemoryStore::new()),
                executor: Arc::new(StalledExecutor {
                    entered: Arc::clone(&entered),
                }),
                connector: Arc::new(LoopbackConnector::new()),
                clock: Arc::new(ManualClock::default()),
                network: Arc::new(NetworkMonitor::new(false)),
            },
        );
        svc.init().await.unwrap();
        svc.submit("place_order", json!({"qty": 1})).await.unwrap();

        svc.report_connectivity(true);
        tokio::time::timeout(std::time::Duration::from_secs(5), entered.notified())
            .await
            .unwrap();
        assert!(svc.inner.queue.is_draining());

        svc.dispose().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while svc.inner.queue.is_draining() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(svc.pending().await.len(), 1);
        assert_eq!(svc.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_init_and_dispose_are_idempotent() {
        let svc = service(
            false,
            MockOperationExecutor::new(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );
        svc.init().await.unwrap();
        svc.init().await.unwrap();
        assert!(!svc.is_online());

        svc.dispose().await;
        svc.dispose().await;
        assert_eq!(svc.connection_state(), ConnectionState::Disconnected);

        // Unhooked: coming online no longer reconnects.
        svc.report_connectivity(true);
        tokio::task::yield_now().await;
        assert_eq!(svc.connection_state(), ConnectionState::Disconnected);
    }
}
