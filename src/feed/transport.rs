//! Text-frame transports for the feed.
//!
//! A [`Connector`] opens a session and hands back a sink for outbound
//! frames and a stream of inbound frames. [`WsConnector`] speaks
//! websocket; [`LoopbackConnector`] is an in-process peer for tests and
//! offline demos.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Outbound half of a session.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of a session. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens feed sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)>;
}

/// Websocket transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        debug!(url, "Websocket handshake complete");
        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(Error::from)
            .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text.into()))));

        let stream = read.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                // Non-UTF-8 payloads fall through to message decoding and are dropped there.
                Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

enum Plan {
    Accept {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    },
    Refuse(String),
}

/// In-process transport driven by the test (or demo) side.
///
/// Each `connect` consumes the next queued plan: an accepted session
/// backed by a [`LoopbackPeer`], or a refusal. With nothing queued the
/// connection is refused.
#[derive(Default)]
pub struct LoopbackConnector {
    plans: Mutex<VecDeque<Plan>>,
    attempts: AtomicU32,
}

impl std::fmt::Debug for LoopbackConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnector")
            .field("queued", &self.plans.lock().len())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session that will be accepted. The returned peer plays the
    /// server side.
    pub fn accept_next(&self) -> LoopbackPeer {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.plans.lock().push_back(Plan::Accept { inbound, outbound });
        LoopbackPeer {
            to_client: Some(to_client),
            from_client,
        }
    }

    /// Queue a refused connection attempt.
    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.plans.lock().push_back(Plan::Refuse(reason.into()));
    }

    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = self.plans.lock().pop_front();
        match plan {
            Some(Plan::Accept { inbound, outbound }) => {
                debug!(url, attempt, "Loopback session accepted");
                let sink = futures::sink::unfold(outbound, |tx, frame: String| async move {
                    tx.send(frame)
                        .map_err(|_| Error::transport("loopback peer closed"))?;
                    Ok::<_, Error>(tx)
                });
                let stream = UnboundedReceiverStream::new(inbound).map(Ok);
                Ok((Box::pin(sink), Box::pin(stream)))
            }
            Some(Plan::Refuse(reason)) => Err(Error::transport(reason)),
            None => Err(Error::transport(format!("connection to {url} refused"))),
        }
    }
}

/// Server side of a loopback session.
#[derive(Debug)]
pub struct LoopbackPeer {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl LoopbackPeer {
    /// Push a raw text frame to the client.
    pub fn send(&self, frame: impl Into<String>) -> Result<()> {
        let tx = self
            .to_client
            .as_ref()
            .ok_or_else(|| Error::transport("loopback session closed"))?;
        tx.send(frame.into())
            .map_err(|_| Error::transport("loopback client gone"))
    }

    /// Next frame sent by the client; `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// End the session from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_plans_are_consumed_in_order() {
        let connector = LoopbackConnector::new();
        connector.refuse_next("boom");
        let mut peer = connector.accept_next();

        let err = connector.connect("ws://loopback").await.err().unwrap();
        assert!(err.to_string().contains("boom"));

        let (mut sink, mut stream) = connector.connect("ws://loopback").await.unwrap();
        sink.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        peer.send("world").unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "world");

        peer.close();
        assert!(stream.next().await.is_none());

        assert!(connector.connect("ws://loopback").await.is_err());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_peer_sees_client_hang_up() {
        let connector = LoopbackConnector::new();
        let mut peer = connector.accept_next();
        let (sink, stream) = connector.connect("ws://loopback").await.unwrap();
        drop(sink);
        drop(stream);
        assert!(peer.recv().await.is_none());
        assert!(peer.send("late").is_err());
    }
}
