//! TTL-aware cache over a [`KeyValueStore`].
//!
//! Entries are never evicted. Freshness is decided at read time against the
//! caller's TTL, so an expired entry is still returned (as [`Freshness::Stale`])
//! for "last known good" display.

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::storage::KeyValueStore;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix for cache entries in the underlying store.
const KEY_PREFIX: &str = "cache:";

/// How a cached value relates to its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Younger than (or exactly) the TTL.
    Fresh,
    /// Present but older than the TTL.
    Stale,
    /// Nothing usable stored.
    Absent,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "Fresh"),
            Self::Stale => write!(f, "Stale"),
            Self::Absent => write!(f, "Absent"),
        }
    }
}

/// A persisted cache value and the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Cache key (without the storage prefix).
    pub key: String,
    /// Cached value.
    pub data: T,
    /// When the value was written.
    pub stored_at: DateTime<Utc>,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRead<T> {
    /// The cached value, `None` only when absent.
    pub data: Option<T>,
    /// When the value was written.
    pub stored_at: Option<DateTime<Utc>>,
    /// Freshness relative to the TTL used for the read.
    pub freshness: Freshness,
}

impl<T> CachedRead<T> {
    /// A miss.
    pub fn absent() -> Self {
        Self {
            data: None,
            stored_at: None,
            freshness: Freshness::Absent,
        }
    }

    /// Classify `entry` against `ttl` at time `now`.
    pub fn classify(entry: CacheEntry<T>, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let age = now - entry.stored_at;
        let freshness = if age <= ttl {
            Freshness::Fresh
        } else {
            Freshness::Stale
        };
        Self {
            data: Some(entry.data),
            stored_at: Some(entry.stored_at),
            freshness,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }

    pub fn is_absent(&self) -> bool {
        self.freshness == Freshness::Absent
    }

    /// Transform the cached value, keeping timestamp and freshness.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CachedRead<U> {
        CachedRead {
            data: self.data.map(f),
            stored_at: self.stored_at,
            freshness: self.freshness,
        }
    }
}

/// Logical datasets the client caches, each with its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheDomain {
    /// Latest full price snapshot from the feed.
    Prices,
    /// Portfolio summary from the REST service.
    Portfolio,
    /// Trade history.
    Trades,
    /// User alerts.
    Alerts,
}

impl CacheDomain {
    /// Cache key for the domain.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Prices => "prices",
            Self::Portfolio => "portfolio",
            Self::Trades => "trades",
            Self::Alerts => "alerts",
        }
    }

    /// Configured TTL for the domain.
    pub fn ttl(&self, config: &CacheConfig) -> Duration {
        let secs = match self {
            Self::Prices => config.prices_ttl_secs,
            Self::Portfolio => config.portfolio_ttl_secs,
            Self::Trades => config.trades_ttl_secs,
            Self::Alerts => config.alerts_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Typed, TTL-classified reads and writes over a key-value store.
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttls: CacheConfig,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("clock", &self.clock)
            .field("ttls", &self.ttls)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Create a cache over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttls: CacheConfig) -> Self {
        Self { store, clock, ttls }
    }

    fn storage_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    /// Store `data` under `key`, stamped with the current time.
    pub async fn write<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> Result<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            data,
            stored_at: self.clock.now(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.store.set(&Self::storage_key(key), bytes).await?;
        debug!(key, "Cache entry written");
        Ok(())
    }

    /// Look up `key` and classify it against `ttl`.
    ///
    /// Storage failures and undecodable entries are logged and reported as
    /// [`Freshness::Absent`].
    pub async fn read<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> CachedRead<T> {
        let bytes = match self.store.get(&Self::storage_key(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return CachedRead::absent(),
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                return CachedRead::absent();
            }
        };

        match serde_json::from_slice::<CacheEntry<T>>(&bytes) {
            Ok(entry) => CachedRead::classify(entry, ttl, self.clock.now()),
            Err(e) => {
                warn!(key, error = %e, "Cache entry undecodable, treating as miss");
                CachedRead::absent()
            }
        }
    }

    /// Invalidate one key.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(&Self::storage_key(key)).await
    }

    /// Invalidate several keys. Every key is attempted; the first failure
    /// is returned.
    pub async fn remove_all<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut first_error = None;
        for key in keys {
            let key = key.as_ref();
            if let Err(e) = self.remove(key).await {
                warn!(key, error = %e, "Cache invalidation failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Write a domain's dataset.
    pub async fn write_domain<T: Serialize + ?Sized>(
        &self,
        domain: CacheDomain,
        data: &T,
    ) -> Result<()> {
        self.write(domain.key(), data).await
    }

    /// Read a domain's dataset with its configured TTL.
    pub async fn read_domain<T: DeserializeOwned>(&self, domain: CacheDomain) -> CachedRead<T> {
        self.read(domain.key(), domain.ttl(&self.ttls)).await
    }
}
