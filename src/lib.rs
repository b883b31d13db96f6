//! # marketsync - real-time market data with offline resilience
//!
//! Keeps a client's view of live prices and user data usable across flaky
//! connectivity: a websocket feed with bounded reconnects, a TTL cache with
//! "last known good" reads, and a durable queue that replays mutations once
//! the device is back online.
//!
//! ## Architecture
//!
//! - **Storage**: pluggable persistent key-value backend
//! - **Cache**: TTL-classified reads over storage
//! - **Queue**: durable pending-operation list with single-flight replay
//! - **Network**: online/offline tracking and an optional TCP probe
//! - **Feed**: connection lifecycle, wire messages and the live price table
//! - **Events**: topic-based publish/subscribe
//! - **Service**: the composition root with an explicit init/dispose lifecycle
//! - **Config**: layered configuration management

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod logging;
pub mod network;
pub mod queue;
pub mod service;
pub mod storage;

pub use cache::{CacheDomain, CacheStore, CachedRead, Freshness};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventBus, Subscription, SyncEvent, Topic};
pub use feed::{ConnectionManager, ConnectionState, ConnectionStatus, PriceTable};
pub use network::{NetworkChange, NetworkMonitor};
pub use queue::{OperationExecutor, PendingOperation, PendingOperationQueue};
pub use service::{PriceSource, PriceView, Submission, SyncParts, SyncService};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
