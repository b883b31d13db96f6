//! Device connectivity tracking.

mod probe;

pub use probe::ConnectivityProbe;

use crate::events::{Listeners, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkChange {
    /// State before the report.
    pub was_online: bool,
    /// State after the report.
    pub is_online: bool,
}

impl NetworkChange {
    /// Offline → online.
    pub fn came_online(&self) -> bool {
        !self.was_online && self.is_online
    }
}

/// Best-effort online/offline state, as reported by the platform.
#[derive(Debug)]
pub struct NetworkMonitor {
    online: Mutex<bool>,
    listeners: Listeners<NetworkChange>,
}

impl NetworkMonitor {
    /// Create a monitor with an initial state.
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: Mutex::new(initially_online),
            listeners: Listeners::new(),
        }
    }

    /// Last reported state.
    pub fn is_online(&self) -> bool {
        *self.online.lock()
    }

    /// Register for transitions.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NetworkChange) + Send + Sync + 'static,
    {
        self.listeners.add(callback)
    }

    /// Feed a platform connectivity report.
    ///
    /// Reports that match the current state are ignored. Returns the
    /// transition if one happened.
    pub fn report(&self, is_online: bool) -> Option<NetworkChange> {
        let change = {
            let mut online = self.online.lock();
            if *online == is_online {
                debug!(is_online, "Connectivity unchanged");
                return None;
            }
            let change = NetworkChange {
                was_online: *online,
                is_online,
            };
            *online = is_online;
            change
        };

        info!(
            was_online = change.was_online,
            is_online = change.is_online,
            "Connectivity changed"
        );
        self.listeners.notify(&change);
        Some(change)
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording(monitor: &NetworkMonitor) -> Arc<Mutex<Vec<NetworkChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_change(move |change| sink.lock().push(*change));
        seen
    }

    #[test]
    fn test_same_state_reports_are_deduplicated() {
        let monitor = NetworkMonitor::new(true);
        let seen = recording(&monitor);

        assert!(monitor.report(true).is_none());
        assert!(monitor.report(true).is_none());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_transitions_notify_with_both_values() {
        let monitor = NetworkMonitor::new(true);
        let seen = recording(&monitor);

        monitor.report(false);
        monitor.report(false);
        let back = monitor.report(true).unwrap();
        assert!(back.came_online());

        assert_eq!(
            *seen.lock(),
            vec![
                NetworkChange {
                    was_online: true,
                    is_online: false
                },
                NetworkChange {
                    was_online: false,
                    is_online: true
                },
            ]
        );
        assert!(monitor.is_online());
    }

    #[test]
    fn test_unsubscribed_listener_not_notified() {
        let monitor = NetworkMonitor::new(false);
        let seen = Arc::new(Mutex::new(0));
        let sub = {
            let seen = Arc::clone(&seen);
            monitor.on_change(move |_| *seen.lock() += 1)
        };
        sub.unsubscribe();
        monitor.report(true);
        assert_eq!(*seen.lock(), 0);
    }
}
