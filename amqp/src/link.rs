//! Send and receive links.
//!
//! A link is a caller-side view of state the event loop owns. Link credit is
//! only ever changed on the loop; [`SendLink::credit`] and
//! [`ReceiveLink::credit`] read a snapshot the loop publishes.

use crate::common::{AmqpError, AmqpResult};
use crate::endpoint::{EndpointState, EndpointStates};
use crate::event_loop::{Command, LoopHandle};
use crate::message::AmqpMessage;
use crate::transport::{DeliveryId, Handle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// A message delivered on a receive link.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub payload: Vec<u8>,
    pub settled: bool,
}

impl Delivery {
    pub fn message(&self) -> AmqpResult<AmqpMessage> {
        AmqpMessage::decode(&self.payload)
    }
}

/// Receives deliveries for a link. Runs on the event loop task, so
/// implementations must not block.
pub trait DeliveryHandler: Send {
    /// Handles one delivery and returns how much credit to grant back.
    fn on_delivery(&mut self, delivery: Delivery) -> u32;

    /// Called once when the link closes, with the error if it failed.
    fn on_closed(&mut self, _error: Option<&AmqpError>) {}
}

/// Forwards deliveries to a channel and re-grants one credit per delivery,
/// keeping the prefetch window full.
pub(crate) struct ChannelDeliveryHandler {
    tx: flume::Sender<AmqpResult<Delivery>>,
}

impl ChannelDeliveryHandler {
    pub(crate) fn new() -> (Self, flume::Receiver<AmqpResult<Delivery>>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl DeliveryHandler for ChannelDeliveryHandler {
    fn on_delivery(&mut self, delivery: Delivery) -> u32 {
        match self.tx.send(Ok(delivery)) {
            Ok(()) => 1,
            Err(_) => 0,
        }
    }

    fn on_closed(&mut self, error: Option<&AmqpError>) {
        if let Some(error) = error {
            let _ = self.tx.send(Err(error.clone()));
        }
    }
}

/// State common to both link roles.
#[derive(Clone)]
struct LinkCore {
    name: String,
    address: String,
    handle: Handle,
    loop_handle: LoopHandle,
    states: EndpointStates,
    credit: Arc<AtomicU32>,
}

impl LinkCore {
    fn detach(&self) {
        if self.states.current().is_closed() {
            return;
        }
        if let Err(e) = self.loop_handle.submit(Command::DetachLink {
            handle: self.handle,
        }) {
            log::debug!("Detach of link '{}' skipped: {e}", self.name);
        }
    }
}

/// Outgoing link to a node.
#[derive(Clone)]
pub struct SendLink {
    core: LinkCore,
}

impl SendLink {
    pub(crate) fn new(
        name: String,
        address: String,
        handle: Handle,
        loop_handle: LoopHandle,
        states: EndpointStates,
        credit: Arc<AtomicU32>,
    ) -> Self {
        Self {
            core: LinkCore {
                name,
                address,
                handle,
                loop_handle,
                states,
                credit,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Target node address.
    pub fn address(&self) -> &str {
        &self.core.address
    }

    /// Credit last granted by the peer and not yet used.
    pub fn credit(&self) -> u32 {
        self.core.credit.load(Ordering::Acquire)
    }

    pub fn endpoint_states(&self) -> EndpointStates {
        self.core.states.clone()
    }

    pub fn state(&self) -> EndpointState {
        self.core.states.current()
    }

    pub async fn wait_active(&self, timeout: Duration) -> AmqpResult<()> {
        self.core.states.clone().wait_active_timeout(timeout).await
    }

    /// Sends `message` unsettled and waits for the peer's disposition.
    pub async fn send(&self, message: &AmqpMessage) -> AmqpResult<()> {
        self.transfer(message.encode()?, false).await
    }

    /// Sends `message` pre-settled; resolves once it is on the wire.
    pub async fn send_settled(&self, message: &AmqpMessage) -> AmqpResult<()> {
        self.transfer(message.encode()?, true).await
    }

    async fn transfer(&self, payload: Vec<u8>, settled: bool) -> AmqpResult<()> {
        if let EndpointState::Closed(error) = self.core.states.current() {
            return Err(error.unwrap_or_else(|| {
                AmqpError::disposed(format!("Link '{}' is closed", self.core.name))
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.core.loop_handle.submit(Command::Transfer {
            handle: self.core.handle,
            payload,
            settled,
            outcome: Some(tx),
        })?;
        rx.await
            .map_err(|_| AmqpError::disposed("Event loop dropped the transfer"))?
    }

    pub fn close(&self) {
        self.core.detach();
    }
}

impl std::fmt::Debug for SendLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendLink")
            .field("name", &self.core.name)
            .field("address", &self.core.address)
            .field("state", &self.core.states.current())
            .finish()
    }
}

/// Incoming link from a node.
///
/// Links created with a custom [`DeliveryHandler`] have no delivery queue;
/// [`ReceiveLink::receive`] is only available for channel-backed links.
pub struct ReceiveLink {
    core: LinkCore,
    deliveries: Option<flume::Receiver<AmqpResult<Delivery>>>,
}

impl ReceiveLink {
    pub(crate) fn new(
        name: String,
        address: String,
        handle: Handle,
        loop_handle: LoopHandle,
        states: EndpointStates,
        credit: Arc<AtomicU32>,
        deliveries: Option<flume::Receiver<AmqpResult<Delivery>>>,
    ) -> Self {
        Self {
            core: LinkCore {
                name,
                address,
                handle,
                loop_handle,
                states,
                credit,
            },
            deliveries,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Source node address.
    pub fn address(&self) -> &str {
        &self.core.address
    }

    /// Outstanding credit granted to the peer.
    pub fn credit(&self) -> u32 {
        self.core.credit.load(Ordering::Acquire)
    }

    pub fn endpoint_states(&self) -> EndpointStates {
        self.core.states.clone()
    }

    pub fn state(&self) -> EndpointState {
        self.core.states.current()
    }

    pub async fn wait_active(&self, timeout: Duration) -> AmqpResult<()> {
        self.core.states.clone().wait_active_timeout(timeout).await
    }

    /// Grants `credit` more deliveries to the peer. Applied on the loop.
    pub fn add_credit(&self, credit: u32) -> AmqpResult<()> {
        if credit == 0 {
            return Ok(());
        }
        self.core.loop_handle.submit(Command::AddCredit {
            handle: self.core.handle,
            credit,
        })
    }

    /// Waits for the next delivery.
    pub async fn receive(&self) -> AmqpResult<Delivery> {
        let Some(deliveries) = &self.deliveries else {
            return Err(AmqpError::InvalidArgument(format!(
                "Link '{}' delivers to a custom handler",
                self.core.name
            )));
        };
        match deliveries.recv_async().await {
            Ok(delivery) => delivery,
            Err(_) => {
                let state = self.core.states.current();
                Err(state.closing_error().unwrap_or_else(|| {
                    AmqpError::disposed(format!("Link '{}' is closed", self.core.name))
                }))
            }
        }
    }

    pub fn close(&self) {
        self.core.detach();
    }
}
