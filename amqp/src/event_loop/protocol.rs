//! Protocol state owned by the event loop task.
//!
//! Nothing in here is shared: sessions, links, credit and unsettled
//! deliveries are touched only from the loop. Callers observe progress
//! through endpoint trackers, credit snapshots and outcome slots.

use super::commands::{AttachRequest, Command, TransferOutcome};
use crate::common::{AmqpError, AmqpResult, ErrorCondition};
use crate::endpoint::EndpointStateTracker;
use crate::link::{Delivery, DeliveryHandler};
use crate::transport::{
    ChannelId, DeliveryId, DeliveryState, Frame, FrameError, Handle, Role, Transport,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// What the loop should do after a peer frame.
#[derive(Debug, PartialEq)]
pub(crate) enum FrameOutcome {
    Continue,
    /// The peer closed the connection, with its error if it gave one.
    PeerClosed(Option<AmqpError>),
}

struct SessionEntry {
    tracker: EndpointStateTracker,
    handles: BTreeSet<Handle>,
}

struct QueuedTransfer {
    payload: Vec<u8>,
    settled: bool,
    outcome: Option<TransferOutcome>,
}

struct LinkEntry {
    channel: ChannelId,
    name: String,
    role: Role,
    tracker: EndpointStateTracker,
    /// Sender: credit granted by the peer. Receiver: credit we granted.
    credit: u32,
    credit_snapshot: Arc<AtomicU32>,
    initial_credit: u32,
    handler: Option<Box<dyn DeliveryHandler>>,
    queued: VecDeque<QueuedTransfer>,
}

impl LinkEntry {
    fn set_credit(&mut self, credit: u32) {
        self.credit = credit;
        self.credit_snapshot.store(credit, Ordering::Release);
    }
}

fn frame_error(error: FrameError) -> AmqpError {
    AmqpError::transport(error.condition, error.description)
}

pub(crate) struct ProtocolState {
    container_id: String,
    hostname: String,
    local_max_frame_size: u32,
    properties: BTreeMap<String, String>,
    max_frame_size: Arc<AtomicU32>,
    connection: EndpointStateTracker,
    sessions: HashMap<ChannelId, SessionEntry>,
    links: HashMap<Handle, LinkEntry>,
    unsettled: HashMap<DeliveryId, (Handle, TransferOutcome)>,
    next_delivery_id: DeliveryId,
    close_sent: bool,
}

impl ProtocolState {
    pub(crate) fn new(
        container_id: String,
        hostname: String,
        local_max_frame_size: u32,
        properties: BTreeMap<String, String>,
        max_frame_size: Arc<AtomicU32>,
        connection: EndpointStateTracker,
    ) -> Self {
        max_frame_size.store(local_max_frame_size, Ordering::Release);
        Self {
            container_id,
            hostname,
            local_max_frame_size,
            properties,
            max_frame_size,
            connection,
            sessions: HashMap::new(),
            links: HashMap::new(),
            unsettled: HashMap::new(),
            next_delivery_id: 0,
            close_sent: false,
        }
    }

    pub(crate) async fn open(&mut self, transport: &mut dyn Transport) -> AmqpResult<()> {
        log::debug!("Opening connection {} to {}", self.container_id, self.hostname);
        transport
            .send(Frame::Open {
                container_id: self.container_id.clone(),
                hostname: self.hostname.clone(),
                max_frame_size: self.local_max_frame_size,
                properties: self.properties.clone(),
            })
            .await
    }

    /// Sends `Close` once. Returns whether it was sent now.
    pub(crate) async fn send_close(&mut self, transport: &mut dyn Transport) -> AmqpResult<bool> {
        if self.close_sent {
            return Ok(false);
        }
        self.close_sent = true;
        transport.send(Frame::Close { error: None }).await?;
        Ok(true)
    }

    pub(crate) async fn on_command(
        &mut self,
        transport: &mut dyn Transport,
        command: Command,
    ) -> AmqpResult<()> {
        match command {
            Command::BeginSession { channel, tracker } => {
                if self.sessions.contains_key(&channel) {
                    tracker.close(Some(AmqpError::InvalidArgument(format!(
                        "Channel {channel} is already in use"
                    ))));
                    return Ok(());
                }
                self.sessions.insert(
                    channel,
                    SessionEntry {
                        tracker,
                        handles: BTreeSet::new(),
                    },
                );
                transport.send(Frame::Begin { channel }).await
            }
            Command::EndSession { channel } => {
                let Some(session) = self.sessions.remove(&channel) else {
                    return Ok(());
                };
                for handle in &session.handles {
                    if self.close_link(*handle, None) {
                        transport
                            .send(Frame::Detach {
                                channel,
                                handle: *handle,
                                error: None,
                            })
                            .await?;
                    }
                }
                session.tracker.close(None);
                transport.send(Frame::End { channel, error: None }).await
            }
            Command::AttachLink(request) => self.attach(transport, *request).await,
            Command::DetachLink { handle } => {
                let Some(channel) = self.links.get(&handle).map(|link| link.channel) else {
                    return Ok(());
                };
                self.close_link(handle, None);
                transport
                    .send(Frame::Detach {
                        channel,
                        handle,
                        error: None,
                    })
                    .await
            }
            Command::Transfer {
                handle,
                payload,
                settled,
                outcome,
            } => self.transfer(transport, handle, payload, settled, outcome).await,
            Command::AddCredit { handle, credit } => {
                let Some(link) = self.links.get_mut(&handle) else {
                    return Ok(());
                };
                if link.role != Role::Receiver || !link.tracker.current().is_active() {
                    return Ok(());
                }
                let total = link.credit.saturating_add(credit);
                link.set_credit(total);
                let channel = link.channel;
                transport
                    .send(Frame::Flow {
                        channel,
                        handle,
                        credit: total,
                    })
                    .await
            }
            Command::Close => Ok(()),
        }
    }

    async fn attach(
        &mut self,
        transport: &mut dyn Transport,
        request: AttachRequest,
    ) -> AmqpResult<()> {
        let AttachRequest {
            channel,
            handle,
            name,
            role,
            source,
            target,
            tracker,
            initial_credit,
            credit,
            mut handler,
        } = request;

        let session_active = self
            .sessions
            .get(&channel)
            .is_some_and(|session| !session.tracker.current().is_closed());
        if !session_active || self.links.contains_key(&handle) {
            let error = AmqpError::disposed(format!(
                "Cannot attach link '{name}': session on channel {channel} is not open"
            ));
            tracker.close(Some(error.clone()));
            if let Some(handler) = handler.as_mut() {
                handler.on_closed(Some(&error));
            }
            return Ok(());
        }

        if let Some(session) = self.sessions.get_mut(&channel) {
            session.handles.insert(handle);
        }
        credit.store(0, Ordering::Release);
        self.links.insert(
            handle,
            LinkEntry {
                channel,
                name: name.clone(),
                role,
                tracker,
                credit: 0,
                credit_snapshot: credit,
                initial_credit,
                handler,
                queued: VecDeque::new(),
            },
        );

        transport
            .send(Frame::Attach {
                channel,
                handle,
                name,
                role,
                source,
                target,
            })
            .await
    }

    async fn transfer(
        &mut self,
        transport: &mut dyn Transport,
        handle: Handle,
        payload: Vec<u8>,
        settled: bool,
        outcome: Option<TransferOutcome>,
    ) -> AmqpResult<()> {
        let max_frame_size = self.max_frame_size.load(Ordering::Acquire) as usize;
        let Some(link) = self.links.get_mut(&handle) else {
            if let Some(outcome) = outcome {
                let _ = outcome.send(Err(AmqpError::disposed("Link is closed")));
            }
            return Ok(());
        };

        if link.role != Role::Sender {
            if let Some(outcome) = outcome {
                let _ = outcome.send(Err(AmqpError::InvalidArgument(format!(
                    "Link '{}' is not a sender",
                    link.name
                ))));
            }
            return Ok(());
        }
        if payload.len() > max_frame_size {
            if let Some(outcome) = outcome {
                let _ = outcome.send(Err(AmqpError::InvalidArgument(format!(
                    "Payload of {} bytes exceeds the negotiated max frame size of {max_frame_size}",
                    payload.len()
                ))));
            }
            return Ok(());
        }

        link.queued.push_back(QueuedTransfer {
            payload,
            settled,
            outcome,
        });
        self.flush(transport, handle).await
    }

    /// Writes queued transfers while the peer has granted credit.
    async fn flush(&mut self, transport: &mut dyn Transport, handle: Handle) -> AmqpResult<()> {
        loop {
            let Some(link) = self.links.get_mut(&handle) else {
                return Ok(());
            };
            if link.credit == 0 || !link.tracker.current().is_active() {
                return Ok(());
            }
            let Some(queued) = link.queued.pop_front() else {
                return Ok(());
            };
            let credit = link.credit - 1;
            link.set_credit(credit);
            let channel = link.channel;

            let delivery_id = self.next_delivery_id;
            self.next_delivery_id = self.next_delivery_id.wrapping_add(1);

            transport
                .send(Frame::Transfer {
                    channel,
                    handle,
                    delivery_id,
                    settled: queued.settled,
                    payload: queued.payload,
                })
                .await?;

            if let Some(outcome) = queued.outcome {
                if queued.settled {
                    let _ = outcome.send(Ok(()));
                } else {
                    self.unsettled.insert(delivery_id, (handle, outcome));
                }
            }
        }
    }

    pub(crate) async fn on_frame(
        &mut self,
        transport: &mut dyn Transport,
        frame: Frame,
    ) -> AmqpResult<FrameOutcome> {
        match frame {
            Frame::Open {
                container_id,
                max_frame_size,
                ..
            } => {
                let negotiated = self.local_max_frame_size.min(max_frame_size);
                self.max_frame_size.store(negotiated, Ordering::Release);
                log::debug!(
                    "Connection {} opened by peer {container_id}, max frame size {negotiated}",
                    self.container_id
                );
                self.connection.activate();
            }
            Frame::Begin { channel } => match self.sessions.get(&channel) {
                Some(session) => {
                    session.tracker.activate();
                }
                None => log::debug!("Ignoring Begin for unknown channel {channel}"),
            },
            Frame::Attach { handle, .. } => self.on_attach(transport, handle).await?,
            Frame::Flow { handle, credit, .. } => {
                let Some(link) = self.links.get_mut(&handle) else {
                    return Ok(FrameOutcome::Continue);
                };
                if link.role == Role::Sender {
                    link.set_credit(credit);
                    self.flush(transport, handle).await?;
                }
            }
            Frame::Transfer {
                channel,
                handle,
                delivery_id,
                settled,
                payload,
            } => {
                self.on_transfer(transport, channel, handle, delivery_id, settled, payload)
                    .await?
            }
            Frame::Disposition {
                delivery_id, state, ..
            } => {
                if let Some((_, outcome)) = self.unsettled.remove(&delivery_id) {
                    let result = match state {
                        DeliveryState::Accepted => Ok(()),
                        DeliveryState::Rejected(error) => Err(AmqpError::ProtocolError(format!(
                            "Delivery rejected ({}): {}",
                            error.condition, error.description
                        ))),
                        DeliveryState::Released => Err(AmqpError::transport(
                            ErrorCondition::Other("amqp:released".to_string()),
                            "Delivery released by peer",
                        )),
                    };
                    let _ = outcome.send(result);
                }
            }
            Frame::Detach {
                channel,
                handle,
                error,
            } => {
                // An unknown handle is the peer confirming our own detach.
                if self.links.contains_key(&handle) {
                    let error = error.map(frame_error).unwrap_or_else(|| {
                        AmqpError::transport(
                            ErrorCondition::LinkDetachForced,
                            "Link detached by peer",
                        )
                    });
                    log::warn!("Link {handle} detached by peer: {error}");
                    self.close_link(handle, Some(error));
                    transport
                        .send(Frame::Detach {
                            channel,
                            handle,
                            error: None,
                        })
                        .await?;
                }
            }
            Frame::End { channel, error } => {
                if let Some(session) = self.sessions.remove(&channel) {
                    let error = error.map(frame_error).unwrap_or_else(|| {
                        AmqpError::transport(
                            ErrorCondition::Other("amqp:session:ended".to_string()),
                            "Session ended by peer",
                        )
                    });
                    log::warn!("Session on channel {channel} ended by peer: {error}");
                    for handle in &session.handles {
                        self.close_link(*handle, Some(error.clone()));
                    }
                    session.tracker.close(Some(error));
                    transport.send(Frame::End { channel, error: None }).await?;
                }
            }
            Frame::Close { error } => {
                let error = error.map(frame_error);
                if !self.close_sent {
                    self.close_sent = true;
                    transport.send(Frame::Close { error: None }).await?;
                }
                return Ok(FrameOutcome::PeerClosed(error));
            }
        }
        Ok(FrameOutcome::Continue)
    }

    async fn on_attach(&mut self, transport: &mut dyn Transport, handle: Handle) -> AmqpResult<()> {
        let Some(link) = self.links.get_mut(&handle) else {
            log::debug!("Ignoring Attach for unknown handle {handle}");
            return Ok(());
        };
        if !link.tracker.activate() {
            return Ok(());
        }
        log::debug!("Link '{}' attached on handle {handle}", link.name);

        match link.role {
            Role::Receiver if link.initial_credit > 0 => {
                let credit = link.initial_credit;
                link.set_credit(credit);
                let channel = link.channel;
                transport
                    .send(Frame::Flow {
                        channel,
                        handle,
                        credit,
                    })
                    .await
            }
            Role::Receiver => Ok(()),
            Role::Sender => self.flush(transport, handle).await,
        }
    }

    async fn on_transfer(
        &mut self,
        transport: &mut dyn Transport,
        channel: ChannelId,
        handle: Handle,
        delivery_id: DeliveryId,
        settled: bool,
        payload: Vec<u8>,
    ) -> AmqpResult<()> {
        let Some(link) = self.links.get_mut(&handle) else {
            log::debug!("Dropping transfer {delivery_id} for unknown handle {handle}");
            return Ok(());
        };
        if link.role != Role::Receiver {
            return Ok(());
        }

        let remaining = link.credit.saturating_sub(1);
        link.set_credit(remaining);

        let regrant = match link.handler.as_mut() {
            Some(handler) => handler.on_delivery(Delivery {
                delivery_id,
                payload,
                settled,
            }),
            None => 0,
        };

        if !settled {
            transport
                .send(Frame::Disposition {
                    channel,
                    delivery_id,
                    state: DeliveryState::Accepted,
                })
                .await?;
        }

        if regrant > 0 {
            let Some(link) = self.links.get_mut(&handle) else {
                return Ok(());
            };
            let credit = link.credit.saturating_add(regrant);
            link.set_credit(credit);
            transport
                .send(Frame::Flow {
                    channel,
                    handle,
                    credit,
                })
                .await?;
        }
        Ok(())
    }

    /// Closes a link locally and fails its queued and unsettled transfers.
    /// Returns whether the link existed.
    fn close_link(&mut self, handle: Handle, error: Option<AmqpError>) -> bool {
        let Some(mut link) = self.links.remove(&handle) else {
            return false;
        };
        if let Some(session) = self.sessions.get_mut(&link.channel) {
            session.handles.remove(&handle);
        }

        link.tracker.close(error.clone());
        link.credit_snapshot.store(0, Ordering::Release);
        if let Some(handler) = link.handler.as_mut() {
            handler.on_closed(error.as_ref());
        }

        let failure = error
            .unwrap_or_else(|| AmqpError::disposed(format!("Link '{}' is closed", link.name)));
        for queued in link.queued.drain(..) {
            if let Some(outcome) = queued.outcome {
                let _ = outcome.send(Err(failure.clone()));
            }
        }

        let unsettled: Vec<DeliveryId> = self
            .unsettled
            .iter()
            .filter(|(_, (owner, _))| *owner == handle)
            .map(|(id, _)| *id)
            .collect();
        for id in unsettled {
            if let Some((_, outcome)) = self.unsettled.remove(&id) {
                let _ = outcome.send(Err(failure.clone()));
            }
        }
        true
    }

    /// Closes every endpoint. `None` means a clean local close.
    pub(crate) fn close_all(&mut self, error: Option<AmqpError>) {
        let handles: Vec<Handle> = self.links.keys().copied().collect();
        for handle in handles {
            self.close_link(handle, error.clone());
        }
        for (_, session) in self.sessions.drain() {
            session.tracker.close(error.clone());
        }
        let failure = error
            .clone()
            .unwrap_or_else(|| AmqpError::disposed("Connection is closed"));
        for (_, (_, outcome)) in self.unsettled.drain() {
            let _ = outcome.send(Err(failure.clone()));
        }
        self.connection.close(error);
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links.len()
    }
}
