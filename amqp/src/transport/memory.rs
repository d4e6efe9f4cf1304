//! In-process transport and a minimal broker that speaks to it.
//!
//! [`MemoryTransport::pair`] connects two frame endpoints with unbounded
//! channels. [`MemoryBroker`] implements [`TransportFactory`]: every connect
//! spawns a task that plays the peer, answering Open/Begin/Attach/Detach/End/
//! Close, granting credit to client senders, respecting client receive
//! credit, and serving the `$cbs` and `$management` nodes. A
//! [`BrokerHandle`] configures replies and injects faults.

use super::{
    ChannelId, DeliveryId, DeliveryState, Frame, FrameError, Handle, Role, Transport,
    TransportFactory,
};
use crate::channels::cbs::CBS_ADDRESS;
use crate::channels::management::MANAGEMENT_ADDRESS;
use crate::common::{AmqpError, AmqpResult, ErrorCondition};
use crate::message::{AmqpMessage, AmqpValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const BROKER_CONTAINER_ID: &str = "memory-broker";
const BROKER_LINK_CREDIT: u32 = 100;

/// One end of an in-process frame pipe.
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryTransport {
    /// Creates two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                tx: Some(a_tx),
                rx: a_rx,
            },
            MemoryTransport {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: Frame) -> AmqpResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AmqpError::disposed("Transport is closed"))?;
        tx.send(frame).map_err(|_| {
            AmqpError::transport(ErrorCondition::ConnectionForced, "Peer has disconnected")
        })
    }

    async fn recv(&mut self) -> AmqpResult<Option<Frame>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> AmqpResult<()> {
        self.tx.take();
        self.rx.close();
        Ok(())
    }
}

/// A `put-token` request as seen by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PutTokenRequest {
    pub audience: String,
    pub token_type: String,
    pub token: String,
}

/// Metadata the broker serves for an event hub.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub partitions: Vec<PartitionRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRecord {
    pub id: String,
    pub begin_sequence_number: i64,
    pub last_enqueued_sequence_number: i64,
    pub last_enqueued_offset: String,
    pub last_enqueued_time: DateTime<Utc>,
    pub is_empty: bool,
}

impl PartitionRecord {
    /// A partition that never received an event.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            begin_sequence_number: -1,
            last_enqueued_sequence_number: -1,
            last_enqueued_offset: "-1".to_string(),
            last_enqueued_time: DateTime::<Utc>::UNIX_EPOCH,
            is_empty: true,
        }
    }
}

#[derive(Debug)]
enum BrokerCommand {
    ReleaseHeld { reverse: bool },
    DetachAddress { address: String, error: FrameError },
    CloseConnection { error: FrameError },
}

#[derive(Default)]
struct BrokerState {
    max_frame_size: u32,
    cbs_status: Option<(i32, String)>,
    management_body_override: Option<AmqpValue>,
    hold_replies: bool,
    entities: HashMap<String, EntityRecord>,
    put_tokens: Vec<PutTokenRequest>,
    management_requests: Vec<AmqpMessage>,
    entity_messages: HashMap<String, Vec<AmqpMessage>>,
    dispositions: usize,
    connections: Vec<mpsc::UnboundedSender<BrokerCommand>>,
    connection_count: usize,
}

/// Shared configuration and observations of a [`MemoryBroker`].
#[derive(Clone, Default)]
pub struct BrokerHandle {
    state: Arc<Mutex<BrokerState>>,
}

impl BrokerHandle {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forces every `put-token` reply to carry this status.
    pub fn set_cbs_status(&self, status_code: i32, description: impl Into<String>) {
        self.lock().cbs_status = Some((status_code, description.into()));
    }

    pub fn clear_cbs_status(&self) {
        self.lock().cbs_status = None;
    }

    /// Replaces the body of every successful management reply.
    pub fn set_management_body(&self, body: AmqpValue) {
        self.lock().management_body_override = Some(body);
    }

    /// Keeps request-response replies until [`release_held_replies`](Self::release_held_replies).
    pub fn hold_replies(&self, hold: bool) {
        self.lock().hold_replies = hold;
    }

    /// Sends held replies, optionally in reverse order of arrival.
    pub fn release_held_replies(&self, reverse: bool) {
        self.broadcast(|| BrokerCommand::ReleaseHeld { reverse });
    }

    /// Force-detaches every link attached to `address`.
    pub fn detach_address(&self, address: &str, condition: ErrorCondition, description: &str) {
        self.broadcast(|| BrokerCommand::DetachAddress {
            address: address.to_string(),
            error: FrameError::new(condition.clone(), description),
        });
    }

    /// Closes every live connection with `condition`.
    pub fn close_connections(&self, condition: ErrorCondition, description: &str) {
        self.broadcast(|| BrokerCommand::CloseConnection {
            error: FrameError::new(condition.clone(), description),
        });
    }

    pub fn add_entity(&self, entity: EntityRecord) {
        self.lock().entities.insert(entity.name.clone(), entity);
    }

    pub fn put_tokens(&self) -> Vec<PutTokenRequest> {
        self.lock().put_tokens.clone()
    }

    pub fn management_requests(&self) -> Vec<AmqpMessage> {
        self.lock().management_requests.clone()
    }

    pub fn entity_messages(&self, address: &str) -> Vec<AmqpMessage> {
        self.lock()
            .entity_messages
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn disposition_count(&self) -> usize {
        self.lock().dispositions
    }

    /// Number of transports ever connected.
    pub fn connection_count(&self) -> usize {
        self.lock().connection_count
    }

    fn broadcast(&self, command: impl Fn() -> BrokerCommand) {
        let mut state = self.lock();
        state.connections.retain(|tx| tx.send(command()).is_ok());
    }
}

/// In-process broker serving [`MemoryTransport`] connections.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::transport::{MemoryBroker, TransportFactory};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// broker.handle().set_cbs_status(401, "Unauthorized");
/// let transport = broker.connect("ns.servicebus.windows.net").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    handle: BrokerHandle,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_max_frame_size(65_536)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        let broker = Self::default();
        broker.handle.lock().max_frame_size = max_frame_size;
        broker
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Serves one client transport; returns the client end.
    pub fn accept(&self) -> MemoryTransport {
        let (client, server) = MemoryTransport::pair();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.handle.lock();
            state.connections.push(command_tx);
            state.connection_count += 1;
        }

        let connection = BrokerConnection::new(self.handle.clone(), server);
        tokio::spawn(connection.run(command_rx));
        client
    }
}

#[async_trait]
impl TransportFactory for MemoryBroker {
    async fn connect(&self, host: &str) -> AmqpResult<Box<dyn Transport>> {
        log::debug!("Memory broker accepting connection for {host}");
        Ok(Box::new(self.accept()))
    }
}

struct BrokerLink {
    channel: ChannelId,
    /// Role of the client end.
    client_role: Role,
    source: String,
    target: String,
    /// For client receivers: credit the client granted us.
    /// For client senders: credit we granted the client.
    credit: u32,
    outbound: VecDeque<Vec<u8>>,
}

struct HeldReply {
    reply_to: String,
    payload: Vec<u8>,
}

struct BrokerConnection {
    handle: BrokerHandle,
    transport: MemoryTransport,
    links: BTreeMap<Handle, BrokerLink>,
    held: Vec<HeldReply>,
    next_delivery_id: DeliveryId,
    closed: bool,
}

impl BrokerConnection {
    fn new(handle: BrokerHandle, transport: MemoryTransport) -> Self {
        Self {
            handle,
            transport,
            links: BTreeMap::new(),
            held: Vec::new(),
            next_delivery_id: 0,
            closed: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BrokerCommand>) {
        while !self.closed {
            let result = tokio::select! {
                frame = self.transport.recv() => match frame {
                    Ok(Some(frame)) => self.on_frame(frame).await,
                    _ => break,
                },
                Some(command) = commands.recv() => self.on_command(command).await,
            };
            if let Err(e) = result {
                log::debug!("Memory broker connection ended: {e}");
                break;
            }
        }
        let _ = self.transport.close().await;
    }

    async fn on_command(&mut self, command: BrokerCommand) -> AmqpResult<()> {
        match command {
            BrokerCommand::ReleaseHeld { reverse } => {
                let mut held = std::mem::take(&mut self.held);
                if reverse {
                    held.reverse();
                }
                for reply in held {
                    self.route_reply(reply.reply_to, reply.payload).await?;
                }
            }
            BrokerCommand::DetachAddress { address, error } => {
                let handles: Vec<(Handle, ChannelId)> = self
                    .links
                    .iter()
                    .filter(|(_, link)| link.source == address || link.target == address)
                    .map(|(handle, link)| (*handle, link.channel))
                    .collect();
                for (handle, channel) in handles {
                    self.links.remove(&handle);
                    self.transport
                        .send(Frame::Detach {
                            channel,
                            handle,
                            error: Some(error.clone()),
                        })
                        .await?;
                }
            }
            BrokerCommand::CloseConnection { error } => {
                self.transport.send(Frame::Close { error: Some(error) }).await?;
                self.closed = true;
            }
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) -> AmqpResult<()> {
        match frame {
            Frame::Open {
                hostname,
                max_frame_size,
                ..
            } => {
                let broker_max = self.handle.lock().max_frame_size;
                let mut properties = BTreeMap::new();
                properties.insert("product".to_string(), BROKER_CONTAINER_ID.to_string());
                self.transport
                    .send(Frame::Open {
                        container_id: BROKER_CONTAINER_ID.to_string(),
                        hostname,
                        max_frame_size: broker_max.min(max_frame_size).max(512),
                        properties,
                    })
                    .await
            }
            Frame::Begin { channel } => self.transport.send(Frame::Begin { channel }).await,
            Frame::Attach {
                channel,
                handle,
                name,
                role,
                source,
                target,
            } => {
                self.on_attach(channel, handle, name, role, source, target)
                    .await
            }
            Frame::Flow { handle, credit, .. } => {
                if let Some(link) = self.links.get_mut(&handle) {
                    if link.client_role == Role::Receiver {
                        link.credit = credit;
                        self.flush(handle).await?;
                    }
                }
                Ok(())
            }
            Frame::Transfer {
                channel,
                handle,
                delivery_id,
                settled,
                payload,
            } => {
                self.on_transfer(channel, handle, delivery_id, settled, payload)
                    .await
            }
            Frame::Disposition { .. } => {
                self.handle.lock().dispositions += 1;
                Ok(())
            }
            Frame::Detach { channel, handle, .. } => {
                if self.links.remove(&handle).is_some() {
                    self.transport
                        .send(Frame::Detach {
                            channel,
                            handle,
                            error: None,
                        })
                        .await?;
                }
                Ok(())
            }
            Frame::End { channel, .. } => {
                self.links.retain(|_, link| link.channel != channel);
                self.transport.send(Frame::End { channel, error: None }).await
            }
            Frame::Close { .. } => {
                self.closed = true;
                self.transport.send(Frame::Close { error: None }).await
            }
        }
    }

    async fn on_attach(
        &mut self,
        channel: ChannelId,
        handle: Handle,
        name: String,
        role: Role,
        source: String,
        target: String,
    ) -> AmqpResult<()> {
        let node = match role {
            Role::Sender => &target,
            Role::Receiver => &source,
        };
        // Refused links are never attached, so the client sees no Active state.
        if !self.is_known_node(node) {
            return self
                .transport
                .send(Frame::Detach {
                    channel,
                    handle,
                    error: Some(FrameError::new(
                        ErrorCondition::NotFound,
                        format!("The messaging entity '{node}' could not be found"),
                    )),
                })
                .await;
        }

        let peer_role = match role {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        };
        self.transport
            .send(Frame::Attach {
                channel,
                handle,
                name,
                role: peer_role,
                source: source.clone(),
                target: target.clone(),
            })
            .await?;

        let credit = if role == Role::Sender {
            BROKER_LINK_CREDIT
        } else {
            0
        };
        self.links.insert(
            handle,
            BrokerLink {
                channel,
                client_role: role,
                source,
                target,
                credit,
                outbound: VecDeque::new(),
            },
        );

        if role == Role::Sender {
            self.transport
                .send(Frame::Flow {
                    channel,
                    handle,
                    credit,
                })
                .await?;
        }
        Ok(())
    }

    fn is_known_node(&self, node: &str) -> bool {
        if node == CBS_ADDRESS || node == MANAGEMENT_ADDRESS {
            return true;
        }
        let entity = node.split('/').next().unwrap_or_default();
        self.handle.lock().entities.contains_key(entity)
    }

    async fn on_transfer(
        &mut self,
        channel: ChannelId,
        handle: Handle,
        delivery_id: DeliveryId,
        settled: bool,
        payload: Vec<u8>,
    ) -> AmqpResult<()> {
        let Some(link) = self.links.get_mut(&handle) else {
            return Ok(());
        };
        let target = link.target.clone();
        link.credit = link.credit.saturating_sub(1);
        let replenish = link.credit == 0;
        if replenish {
            link.credit = BROKER_LINK_CREDIT;
        }

        let message = AmqpMessage::decode(&payload);
        if !settled {
            let state = match &message {
                Ok(_) => DeliveryState::Accepted,
                Err(e) => DeliveryState::Rejected(FrameError::new(
                    ErrorCondition::Other("amqp:decode-error".to_string()),
                    e.to_string(),
                )),
            };
            self.transport
                .send(Frame::Disposition {
                    channel,
                    delivery_id,
                    state,
                })
                .await?;
        }
        if replenish {
            self.transport
                .send(Frame::Flow {
                    channel,
                    handle,
                    credit: BROKER_LINK_CREDIT,
                })
                .await?;
        }

        let Ok(message) = message else {
            return Ok(());
        };

        let reply = match target.as_str() {
            CBS_ADDRESS => Some(self.cbs_reply(&message)),
            MANAGEMENT_ADDRESS => Some(self.management_reply(&message)),
            _ => {
                self.handle
                    .lock()
                    .entity_messages
                    .entry(target)
                    .or_default()
                    .push(message.clone());
                None
            }
        };

        if let (Some(reply), Some(reply_to)) = (reply, message.properties.reply_to.clone()) {
            let payload = reply.encode()?;
            if self.handle.lock().hold_replies {
                self.held.push(HeldReply { reply_to, payload });
            } else {
                self.route_reply(reply_to, payload).await?;
            }
        }
        Ok(())
    }

    fn cbs_reply(&self, request: &AmqpMessage) -> AmqpMessage {
        let mut state = self.handle.lock();
        let operation = request.application_property("operation").and_then(AmqpValue::as_str);
        let audience = request.application_property("name").and_then(AmqpValue::as_str);
        let token_type = request.application_property("type").and_then(AmqpValue::as_str);

        let (status, description) = match (operation, audience, token_type, request.body.as_str()) {
            (Some("put-token"), Some(audience), Some(token_type), Some(token)) => {
                state.put_tokens.push(PutTokenRequest {
                    audience: audience.to_string(),
                    token_type: token_type.to_string(),
                    token: token.to_string(),
                });
                state
                    .cbs_status
                    .clone()
                    .unwrap_or((202, "Accepted".to_string()))
            }
            _ => (400, "Malformed put-token request".to_string()),
        };

        Self::reply_to(request, status, &description, AmqpValue::Null)
    }

    fn management_reply(&self, request: &AmqpMessage) -> AmqpMessage {
        let mut state = self.handle.lock();
        state.management_requests.push(request.clone());

        let property = |key: &str| request.application_property(key).and_then(AmqpValue::as_str);
        if property("security_token").is_none() {
            return Self::reply_to(request, 401, "Missing security token", AmqpValue::Null);
        }
        if property("operation") != Some("READ") {
            return Self::reply_to(request, 400, "Unsupported operation", AmqpValue::Null);
        }
        let Some(entity) = property("name").and_then(|name| state.entities.get(name)) else {
            return Self::reply_to(request, 404, "Entity not found", AmqpValue::Null);
        };

        let body = match property("type") {
            Some("com.microsoft:eventhub") => {
                let mut map = BTreeMap::new();
                map.insert("name".to_string(), AmqpValue::from(entity.name.as_str()));
                map.insert(
                    "created_at".to_string(),
                    AmqpValue::Timestamp(entity.created_at.timestamp_millis()),
                );
                map.insert(
                    "partition_ids".to_string(),
                    AmqpValue::List(
                        entity
                            .partitions
                            .iter()
                            .map(|p| AmqpValue::from(p.id.as_str()))
                            .collect(),
                    ),
                );
                AmqpValue::Map(map)
            }
            Some("com.microsoft:partition") => {
                let id = property("partition").unwrap_or_default();
                let Some(partition) = entity.partitions.iter().find(|p| p.id == id) else {
                    return Self::reply_to(request, 404, "Partition not found", AmqpValue::Null);
                };
                let mut map = BTreeMap::new();
                map.insert("name".to_string(), AmqpValue::from(entity.name.as_str()));
                map.insert("partition".to_string(), AmqpValue::from(partition.id.as_str()));
                map.insert(
                    "begin_sequence_number".to_string(),
                    AmqpValue::Long(partition.begin_sequence_number),
                );
                map.insert(
                    "last_enqueued_sequence_number".to_string(),
                    AmqpValue::Long(partition.last_enqueued_sequence_number),
                );
                map.insert(
                    "last_enqueued_offset".to_string(),
                    AmqpValue::from(partition.last_enqueued_offset.as_str()),
                );
                map.insert(
                    "last_enqueued_time_utc".to_string(),
                    AmqpValue::Timestamp(partition.last_enqueued_time.timestamp_millis()),
                );
                map.insert(
                    "is_partition_empty".to_string(),
                    AmqpValue::Bool(partition.is_empty),
                );
                AmqpValue::Map(map)
            }
            _ => return Self::reply_to(request, 400, "Unknown entity type", AmqpValue::Null),
        };

        let body = state.management_body_override.clone().unwrap_or(body);
        Self::reply_to(request, 200, "OK", body)
    }

    fn reply_to(request: &AmqpMessage, status: i32, description: &str, body: AmqpValue) -> AmqpMessage {
        let mut reply = AmqpMessage::new()
            .with_application_property("status-code", status)
            .with_application_property("status-description", description)
            .with_body(body);
        reply.properties.correlation_id = request.properties.message_id.clone();
        reply
    }

    async fn route_reply(&mut self, reply_to: String, payload: Vec<u8>) -> AmqpResult<()> {
        let handle = self
            .links
            .iter()
            .find(|(_, link)| link.client_role == Role::Receiver && link.target == reply_to)
            .map(|(handle, _)| *handle);

        match handle {
            Some(handle) => {
                if let Some(link) = self.links.get_mut(&handle) {
                    link.outbound.push_back(payload);
                }
                self.flush(handle).await
            }
            None => {
                log::debug!("Memory broker dropping reply for unknown address {reply_to}");
                Ok(())
            }
        }
    }

    async fn flush(&mut self, handle: Handle) -> AmqpResult<()> {
        loop {
            let Some(link) = self.links.get_mut(&handle) else {
                return Ok(());
            };
            if link.credit == 0 {
                return Ok(());
            }
            let Some(payload) = link.outbound.pop_front() else {
                return Ok(());
            };
            link.credit -= 1;
            let channel = link.channel;
            let delivery_id = self.next_delivery_id;
            self.next_delivery_id = self.next_delivery_id.wrapping_add(1);

            self.transport
                .send(Frame::Transfer {
                    channel,
                    handle,
                    delivery_id,
                    settled: false,
                    payload,
                })
                .await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_frames_both_ways() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send(Frame::Begin { channel: 1 }).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(Frame::Begin { channel: 1 }));

        b.close().await.unwrap();
        assert_eq!(a.recv().await.unwrap(), None);
        assert!(a.send(Frame::Close { error: None }).await.is_err());
    }

    #[tokio::test]
    async fn test_broker_answers_open_with_negotiated_frame_size() {
        let broker = MemoryBroker::with_max_frame_size(4096);
        let mut transport = broker.accept();

        transport
            .send(Frame::Open {
                container_id: "client".to_string(),
                hostname: "ns".to_string(),
                max_frame_size: 65_536,
                properties: BTreeMap::new(),
            })
            .await
            .unwrap();

        match transport.recv().await.unwrap() {
            Some(Frame::Open { max_frame_size, .. }) => assert_eq!(max_frame_size, 4096),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broker_serves_cbs_node() {
        let broker = MemoryBroker::new();
        let mut transport = broker.accept();

        transport.send(Frame::Begin { channel: 0 }).await.unwrap();
        transport
            .send(Frame::Attach {
                channel: 0,
                handle: 1,
                name: "cbs-sender".to_string(),
                role: Role::Sender,
                source: "cbs-sender".to_string(),
                target: CBS_ADDRESS.to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(transport.recv().await.unwrap(), Some(Frame::Begin { .. })));
        assert!(matches!(
            transport.recv().await.unwrap(),
            Some(Frame::Attach { handle: 1, .. })
        ));
        match transport.recv().await.unwrap() {
            Some(Frame::Flow { handle, credit, .. }) => {
                assert_eq!(handle, 1);
                assert_eq!(credit, BROKER_LINK_CREDIT);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broker_refuses_unknown_address() {
        let broker = MemoryBroker::new();
        let mut transport = broker.accept();

        transport.send(Frame::Begin { channel: 0 }).await.unwrap();
        transport
            .send(Frame::Attach {
                channel: 0,
                handle: 7,
                name: "s".to_string(),
                role: Role::Sender,
                source: "client".to_string(),
                target: "missing-hub".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(transport.recv().await.unwrap(), Some(Frame::Begin { .. })));
        match transport.recv().await.unwrap() {
            Some(Frame::Detach { handle, error, .. }) => {
                assert_eq!(handle, 7);
                assert_eq!(error.unwrap().condition, ErrorCondition::NotFound);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
