//! Real-time market feed.

pub mod backoff;
mod connection;
mod messages;
mod transport;

pub use backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff};
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState, ConnectionStatus};
pub use messages::{Alert, ControlMessage, FeedMessage, PriceTable, PriceUpdate};
pub use transport::{
    Connector, FrameSink, FrameStream, LoopbackConnector, LoopbackPeer, WsConnector,
};
