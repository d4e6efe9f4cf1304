//! Physical transport seam below the protocol engine.
//!
//! The event loop speaks AMQP performatives ([`Frame`]) to a [`Transport`].
//! Framing and encoding of the performatives belong to the transport, which
//! lets the engine run unchanged over a socket codec or the in-process
//! [`memory`] transport.

pub mod memory;

use crate::common::{AmqpResult, ErrorCondition};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub use memory::{BrokerHandle, MemoryBroker, MemoryTransport};

/// Channel number of a session on the connection.
pub type ChannelId = u16;
/// Link handle, unique per connection in this engine.
pub type Handle = u32;
pub type DeliveryId = u32;

/// Which end of a link this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Error description carried by `Detach`, `End` and `Close`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameError {
    pub condition: ErrorCondition,
    pub description: String,
}

impl FrameError {
    pub fn new(condition: ErrorCondition, description: impl Into<String>) -> Self {
        Self {
            condition,
            description: description.into(),
        }
    }
}

/// Outcome of a delivery as reported by the receiving side.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Accepted,
    Rejected(FrameError),
    Released,
}

/// AMQP 1.0 performatives exchanged with the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open {
        container_id: String,
        hostname: String,
        max_frame_size: u32,
        properties: BTreeMap<String, String>,
    },
    Begin {
        channel: ChannelId,
    },
    Attach {
        channel: ChannelId,
        handle: Handle,
        name: String,
        role: Role,
        source: String,
        target: String,
    },
    Flow {
        channel: ChannelId,
        handle: Handle,
        credit: u32,
    },
    Transfer {
        channel: ChannelId,
        handle: Handle,
        delivery_id: DeliveryId,
        settled: bool,
        payload: Vec<u8>,
    },
    Disposition {
        channel: ChannelId,
        delivery_id: DeliveryId,
        state: DeliveryState,
    },
    Detach {
        channel: ChannelId,
        handle: Handle,
        error: Option<FrameError>,
    },
    End {
        channel: ChannelId,
        error: Option<FrameError>,
    },
    Close {
        error: Option<FrameError>,
    },
}

/// Frame pipe to the peer.
///
/// `recv` must be cancel-safe: the event loop polls it inside `select!` and
/// may drop the future when a local command arrives first.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> AmqpResult<()>;

    /// Next frame from the peer; `Ok(None)` once the peer has hung up.
    async fn recv(&mut self) -> AmqpResult<Option<Frame>>;

    /// Releases the underlying resources. Idempotent.
    async fn close(&mut self) -> AmqpResult<()>;
}

/// Opens transports to a host; used to (re)create connections on demand.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, host: &str) -> AmqpResult<Box<dyn Transport>>;
}
