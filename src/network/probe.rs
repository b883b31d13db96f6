//! TCP reachability probe.
//!
//! Hosts without a platform connectivity API can run a probe that
//! periodically opens a TCP connection to a known address and reports
//! the outcome to a [`NetworkMonitor`].

use super::NetworkMonitor;
use crate::config::NetworkConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodic reachability check feeding a [`NetworkMonitor`].
#[derive(Debug)]
pub struct ConnectivityProbe {
    addr: String,
    interval: Duration,
    timeout: Duration,
    monitor: Arc<NetworkMonitor>,
    cancel: CancellationToken,
}

impl ConnectivityProbe {
    /// Create a probe for `addr` (`host:port`).
    pub fn new(
        addr: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        monitor: Arc<NetworkMonitor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr: addr.into(),
            interval,
            timeout,
            monitor,
            cancel,
        }
    }

    /// Build a probe from configuration. `None` when no address is configured.
    pub fn from_config(
        config: &NetworkConfig,
        monitor: Arc<NetworkMonitor>,
        cancel: CancellationToken,
    ) -> Option<Self> {
        let addr = config.probe_addr.clone()?;
        Some(Self::new(
            addr,
            config.probe_interval(),
            config.probe_timeout(),
            monitor,
            cancel,
        ))
    }

    /// Whether the address accepted a connection within the timeout.
    pub async fn check(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "Probe connect failed");
                false
            }
            Err(_) => {
                debug!(addr = %self.addr, "Probe timed out");
                false
            }
        }
    }

    /// Check once and report the result.
    pub async fn probe_once(&self) -> bool {
        let reachable = self.check().await;
        self.monitor.report(reachable);
        reachable
    }

    /// Probe every interval until cancelled.
    pub async fn run(self) {
        info!(addr = %self.addr, interval_secs = self.interval.as_secs(), "Connectivity probe started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Connectivity probe stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
    }
}
