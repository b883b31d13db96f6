//! Feed connection lifecycle.
//!
//! [`ConnectionManager`] owns one background task per connect cycle. The
//! task opens a session, applies inbound messages to the price table,
//! forwards symbol subscriptions, and retries with backoff after a
//! failure until the attempt budget runs out.

use super::backoff::{self, BackoffStrategy};
use super::messages::{ControlMessage, FeedMessage, PriceTable};
use super::transport::{Connector, FrameSink, FrameStream};
use crate::cache::{CacheDomain, CacheStore};
use crate::config::FeedConfig;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest frame excerpt included in decode warnings.
const FRAME_EXCERPT_LEN: usize = 120;

/// Lifecycle of the feed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Retrying after a failure; carries the 1-based attempt number.
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting(attempt) => write!(f, "Reconnecting ({attempt})"),
        }
    }
}

/// Payload of a `connection` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: ConnectionState,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        Self {
            connected: state.is_connected(),
            state,
        }
    }
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    /// Retries after a failure before giving up. Zero disables retrying.
    pub max_attempts: u32,
    pub backoff: Arc<dyn BackoffStrategy>,
}

impl ConnectionSettings {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_attempts: config.max_reconnect_attempts,
            backoff: backoff::from_config(config),
        }
    }
}

#[derive(Default)]
struct Subscriptions {
    desired: BTreeSet<String>,
    /// Control channel of the live session, if any.
    outbound: Option<mpsc::UnboundedSender<ControlMessage>>,
}

struct Shared {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    cache: CacheStore,
    state: watch::Sender<ConnectionState>,
    prices: RwLock<PriceTable>,
    subscriptions: Mutex<Subscriptions>,
}

impl Shared {
    /// Move to `next` unless `cancel` has fired, publishing on change.
    ///
    /// The cancellation check happens under the state lock, so a cycle
    /// that has been superseded can never overwrite its successor's state.
    fn transition(&self, cancel: Option<&CancellationToken>, next: ConnectionState) -> bool {
        let changed = self.apply(cancel, next);
        if changed {
            self.announce(next);
        }
        changed
    }

    /// Update the state without publishing.
    fn apply(&self, cancel: Option<&CancellationToken>, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if cancel.is_some_and(CancellationToken::is_cancelled) || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "Connection state change");
            *state = next;
            true
        })
    }

    /// Publish a `connection` event. Never call with a lock held: subscribers
    /// may call back into the manager.
    fn announce(&self, state: ConnectionState) {
        self.bus.publish(SyncEvent::Connection(state.into()));
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let url = self.settings.url.clone();
        let mut attempt: u32 = 0;

        loop {
            let opened = tokio::select! {
                () = cancel.cancelled() => return,
                opened = self.connector.connect(&url) => opened,
            };

            match opened {
                Ok((sink, stream)) => {
                    attempt = 0;
                    match self.session(sink, stream, &cancel).await {
                        SessionEnd::Cancelled => return,
                        SessionEnd::Closed(reason) => warn!(%url, %reason, "Feed session ended"),
                    }
                }
                Err(e) => warn!(%url, attempt, error = %e, "Feed connection failed"),
            }

            if attempt >= self.settings.max_attempts {
                warn!(%url, max_attempts = self.settings.max_attempts, "Reconnect attempts exhausted");
                self.transition(Some(&cancel), ConnectionState::Disconnected);
                return;
            }

            attempt += 1;
            if !self.transition(Some(&cancel), ConnectionState::Reconnecting(attempt)) {
                return;
            }
            let delay = self.settings.backoff.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling feed reconnect");

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        mut sink: FrameSink,
        mut stream: FrameStream,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let resend: Vec<String> = {
            let mut subs = self.subscriptions.lock();
            subs.outbound = Some(control_tx);
            subs.desired.iter().cloned().collect()
        };

        let end = self.pump(&mut sink, &mut stream, &mut control_rx, resend, cancel).await;

        self.subscriptions.lock().outbound = None;
        if matches!(end, SessionEnd::Cancelled) {
            let _ = sink.close().await;
        }
        end
    }

    async fn pump(
        &self,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
        control_rx: &mut mpsc::UnboundedReceiver<ControlMessage>,
        resend: Vec<String>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        if !self.transition(Some(cancel), ConnectionState::Connected) {
            return SessionEnd::Cancelled;
        }
        info!(url = %self.settings.url, "Feed connected");

        if !resend.is_empty() {
            debug!(count = resend.len(), "Restoring symbol subscriptions");
            let control = ControlMessage::Subscribe { symbols: resend };
            if let Err(e) = send_control(sink, &control).await {
                return SessionEnd::Closed(e.to_string());
            }
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                Some(control) = control_rx.recv() => {
                    if let Err(e) = send_control(sink, &control).await {
                        return SessionEnd::Closed(e.to_string());
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text).await,
                    Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                },
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let message = match FeedMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, frame = excerpt(text), "Dropping undecodable feed message");
                return;
            }
        };

        match message {
            FeedMessage::Prices { prices } => {
                debug!(symbols = prices.len(), "Price snapshot");
                *self.prices.write() = prices.clone();
                self.bus.publish(SyncEvent::Prices(prices.clone()));
                if let Err(e) = self.cache.write_domain(CacheDomain::Prices, &prices).await {
                    warn!(error = %e, "Failed to cache price snapshot");
                }
            }
            FeedMessage::PriceUpdate(update) => {
                self.prices.write().insert(update.symbol.clone(), update.price);
                self.bus.publish(SyncEvent::PriceUpdate(update));
            }
            FeedMessage::Alert(alert) => {
                self.bus.publish(SyncEvent::Alert(alert));
            }
        }
    }
}

enum SessionEnd {
    Cancelled,
    Closed(String),
}

async fn send_control(sink: &mut FrameSink, control: &ControlMessage) -> Result<()> {
    debug!(?control, "Sending control message");
    sink.send(control.to_json()?).await
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(FRAME_EXCERPT_LEN) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Owns the feed connection and the live price table.
///
/// `connect` must be called from within a tokio runtime.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    /// Cancels the running connect cycle.
    cycle: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.settings.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
        cache: CacheStore,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                bus,
                cache,
                state,
                prices: RwLock::new(PriceTable::new()),
                subscriptions: Mutex::new(Subscriptions::default()),
            }),
            cycle: Mutex::new(None),
        }
    }

    /// Start connecting.
    ///
    /// Ignored while connected or connecting. During a reconnect wait the
    /// pending retry is abandoned and a fresh attempt starts immediately
    /// with the attempt counter reset.
    pub fn connect(&self) {
        let cancel = {
            let mut cycle = self.cycle.lock();
            match self.state() {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    debug!(state = %self.state(), "Connect ignored");
                    return;
                }
                ConnectionState::Reconnecting(attempt) => {
                    info!(attempt, "Manual connect, skipping reconnect wait");
                }
                ConnectionState::Disconnected => {}
            }

            if let Some(old) = cycle.take() {
                old.cancel();
            }
            self.shared.apply(None, ConnectionState::Connecting);
            let cancel = CancellationToken::new();
            *cycle = Some(cancel.clone());
            cancel
        };

        // The worker starts after the event so `Connecting` is always
        // delivered before anything the worker publishes.
        self.shared.announce(ConnectionState::Connecting);
        info!(url = %self.shared.settings.url, "Connecting to feed");
        tokio::spawn(Arc::clone(&self.shared).run(cancel));
    }

    /// Close the session and cancel any pending retry. Safe in any state.
    pub fn disconnect(&self) {
        let changed = {
            let mut cycle = self.cycle.lock();
            if let Some(old) = cycle.take() {
                old.cancel();
            }
            self.shared.apply(None, ConnectionState::Disconnected)
        };
        if changed {
            info!("Feed disconnected");
            self.shared.announce(ConnectionState::Disconnected);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Copy of the live price table.
    pub fn prices(&self) -> PriceTable {
        self.shared.prices.read().clone()
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.shared.prices.read().get(symbol)
    }

    /// Symbols that will be (re)subscribed on every connect.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.shared.subscriptions.lock().desired.iter().cloned().collect()
    }

    /// Add symbols to the subscription set. Newly added symbols are sent
    /// right away when connected; all of them are resent on reconnect.
    pub fn subscribe_to_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subs = self.shared.subscriptions.lock();
        let added: Vec<String> = normalize(symbols)
            .filter(|symbol| subs.desired.insert(symbol.clone()))
            .collect();
        if added.is_empty() {
            return;
        }
        info!(symbols = ?added, "Subscribing to symbols");
        if let Some(tx) = &subs.outbound {
            let _ = tx.send(ControlMessage::Subscribe { symbols: added });
        }
    }

    /// Remove symbols from the subscription set.
    pub fn unsubscribe_from_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subs = self.shared.subscriptions.lock();
        let removed: Vec<String> = normalize(symbols)
            .filter(|symbol| subs.desired.remove(symbol))
            .collect();
        if removed.is_empty() {
            return;
        }
        info!(symbols = ?removed, "Unsubscribing from symbols");
        if let Some(tx) = &subs.outbound {
            let _ = tx.send(ControlMessage::Unsubscribe { symbols: removed });
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.cycle.get_mut().take() {
            cancel.cancel();
        }
    }
}

fn normalize<I, S>(symbols: I) -> impl Iterator<Item = String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    symbols
        .into_iter()
        .map(|symbol| symbol.into().trim().to_string())
        .filter(|symbol| !symbol.is_empty())
}
