//! Correlated request/response over a pair of links to one node.
//!
//! A request is sent pre-settled on the send link with a fresh `message_id`
//! and this channel's private `reply_to` address. The peer answers on the
//! receive link with `correlation_id` set to that id. Replies are matched on
//! the event loop and handed to the waiting caller through a oneshot slot.

use crate::common::{AmqpError, AmqpResult};
use crate::connection::Connection;
use crate::link::{Delivery, DeliveryHandler, ReceiveLink, SendLink};
use crate::message::{AmqpMessage, AmqpValue};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

pub const STATUS_CODE_KEY: &str = "status-code";
pub const STATUS_DESCRIPTION_KEY: &str = "status-description";

/// Credit granted to the reply link when it attaches.
const REPLY_LINK_CREDIT: u32 = 50;

type ReplySlot = oneshot::Sender<AmqpResult<AmqpMessage>>;

/// Status codes a request-response peer uses for success.
pub fn is_success_status(status_code: i32) -> bool {
    matches!(status_code, 200 | 202)
}

/// Reads `status-code` and `status-description` from a reply.
pub fn reply_status(reply: &AmqpMessage) -> AmqpResult<(i32, String)> {
    let status = reply
        .application_property(STATUS_CODE_KEY)
        .and_then(AmqpValue::as_i64)
        .ok_or_else(|| AmqpError::ProtocolError("Reply is missing a status code".to_string()))?;
    let status = i32::try_from(status)
        .map_err(|_| AmqpError::ProtocolError(format!("Status code {status} is out of range")))?;
    let description = reply
        .application_property(STATUS_DESCRIPTION_KEY)
        .and_then(AmqpValue::as_str)
        .unwrap_or_default()
        .to_string();
    Ok((status, description))
}

#[derive(Default)]
struct PendingTable {
    slots: HashMap<String, ReplySlot>,
    terminated: Option<AmqpError>,
}

/// Requests awaiting a reply, keyed by correlation id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    table: Mutex<PendingTable>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: String) -> AmqpResult<oneshot::Receiver<AmqpResult<AmqpMessage>>> {
        let mut table = self.lock();
        if let Some(error) = &table.terminated {
            return Err(error.clone());
        }
        if table.slots.contains_key(&id) {
            return Err(AmqpError::InvalidArgument(format!(
                "Correlation id {id} is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        table.slots.insert(id, tx);
        Ok(rx)
    }

    fn complete(&self, id: &str, result: AmqpResult<AmqpMessage>) -> bool {
        let slot = self.lock().slots.remove(id);
        match slot {
            Some(slot) => {
                let _ = slot.send(result);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: &str) {
        self.lock().slots.remove(id);
    }

    /// Fails every pending request with `error` and refuses new ones.
    /// Only the first call has any effect.
    pub(crate) fn fail_all(&self, error: AmqpError) -> usize {
        let slots = {
            let mut table = self.lock();
            if table.terminated.is_some() {
                return 0;
            }
            table.terminated = Some(error.clone());
            std::mem::take(&mut table.slots)
        };
        let count = slots.len();
        for (_, slot) in slots {
            let _ = slot.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().slots.len()
    }
}

/// Removes the pending slot if the caller stops waiting early.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Matches replies to pending requests. Runs on the event loop.
struct ReplyHandler {
    pending: Arc<PendingRequests>,
    address: String,
}

impl ReplyHandler {
    fn resolve(reply: AmqpMessage) -> AmqpResult<AmqpMessage> {
        let (status_code, description) = reply_status(&reply)?;
        if is_success_status(status_code) {
            Ok(reply)
        } else {
            Err(AmqpError::ServiceError {
                status_code,
                description,
            })
        }
    }
}

impl DeliveryHandler for ReplyHandler {
    fn on_delivery(&mut self, delivery: Delivery) -> u32 {
        let reply = match delivery.message() {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Dropping undecodable reply from {}: {e}", self.address);
                return 1;
            }
        };
        let Some(id) = reply.properties.correlation_id.clone() else {
            log::warn!("Dropping reply from {} without a correlation id", self.address);
            return 1;
        };

        if !self.pending.complete(&id, Self::resolve(reply)) {
            log::debug!("Dropping reply from {} for unknown correlation id {id}", self.address);
        }
        1
    }

    fn on_closed(&mut self, error: Option<&AmqpError>) {
        let error = error
            .cloned()
            .unwrap_or_else(|| AmqpError::disposed(format!("Reply link for {} closed", self.address)));
        let failed = self.pending.fail_all(error);
        if failed > 0 {
            log::warn!("Failed {failed} pending requests to {}", self.address);
        }
    }
}

/// Request/response channel to a control node such as `$cbs`.
pub struct RequestResponseChannel {
    address: String,
    reply_address: String,
    session: Arc<Session>,
    connection: Weak<Connection>,
    sender: SendLink,
    receiver: ReceiveLink,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RequestResponseChannel {
    /// Opens a channel to `address` on the session called `session_name`.
    pub async fn open(
        connection: &Arc<Connection>,
        session_name: &str,
        address: &str,
    ) -> AmqpResult<Self> {
        let session = connection.create_session(session_name).await?;
        let link_name = format!(
            "{}-{}",
            address.trim_start_matches('$'),
            uuid::Uuid::new_v4().simple()
        );
        let reply_address = format!("{link_name}-client-reply-to");
        let pending = Arc::new(PendingRequests::default());

        let sender = session.create_send_link(&format!("{link_name}-sender"), address)?;
        let receiver = session.create_receive_link_with_handler(
            &format!("{link_name}-receiver"),
            address,
            &reply_address,
            REPLY_LINK_CREDIT,
            Box::new(ReplyHandler {
                pending: pending.clone(),
                address: address.to_string(),
            }),
        )?;
        log::debug!("Opened request-response channel to {address} (reply to {reply_address})");

        Ok(Self {
            address: address.to_string(),
            reply_address,
            session,
            connection: Arc::downgrade(connection),
            sender,
            receiver,
            pending,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends `message` and waits for the correlated reply.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `message` already carries a `message_id` or
    ///   `reply_to`.
    /// - `ServiceError` if the reply status is not 200 or 202.
    /// - The link's closing error if either link fails first.
    pub async fn send(&self, mut message: AmqpMessage) -> AmqpResult<AmqpMessage> {
        if self.is_closed() {
            return Err(AmqpError::disposed(format!(
                "Request-response channel to {} is closed",
                self.address
            )));
        }
        if message.properties.message_id.is_some() {
            return Err(AmqpError::InvalidArgument(
                "Request already has a message id".to_string(),
            ));
        }
        if message.properties.reply_to.is_some() {
            return Err(AmqpError::InvalidArgument(
                "Request already has a reply-to address".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        message.properties.message_id = Some(id.clone());
        message.properties.reply_to = Some(self.reply_address.clone());

        let reply = self.pending.register(id.clone())?;
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.sender.endpoint_states().wait_active().await?;
        self.receiver.endpoint_states().wait_active().await?;
        self.sender.send_settled(&message).await?;

        reply.await.map_err(|_| {
            AmqpError::disposed(format!("Request to {} was abandoned", self.address))
        })?
    }

    /// [`send`](Self::send) bounded by `timeout`. The pending entry is
    /// removed on timeout and a late reply is dropped.
    pub async fn send_with_timeout(
        &self,
        message: AmqpMessage,
        timeout: Duration,
    ) -> AmqpResult<AmqpMessage> {
        tokio::time::timeout(timeout, self.send(message))
            .await
            .map_err(|_| {
                AmqpError::Timeout(format!(
                    "No reply from {} within {timeout:?}",
                    self.address
                ))
            })?
    }

    /// Fails in-flight requests, detaches both links and removes the session
    /// from the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.fail_all(AmqpError::disposed(format!(
            "Request-response channel to {} is closed",
            self.address
        )));
        self.sender.close();
        self.receiver.close();

        match self.connection.upgrade() {
            Some(connection) => {
                connection.remove_session(self.session.name()).await;
            }
            None => self.session.close(),
        }
        log::debug!("Closed request-response channel to {}", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorCondition;

    #[test]
    fn test_fail_all_runs_once() {
        let pending = PendingRequests::default();
        let mut a = pending.register("1".to_string()).unwrap();
        let mut b = pending.register("2".to_string()).unwrap();

        let error = AmqpError::transport(ErrorCondition::ConnectionForced, "gone");
        assert_eq!(pending.fail_all(error.clone()), 2);
        assert_eq!(pending.fail_all(error.clone()), 0);

        assert_eq!(a.try_recv().unwrap(), Err(error.clone()));
        assert_eq!(b.try_recv().unwrap(), Err(error.clone()));
        assert_eq!(pending.register("3".to_string()).unwrap_err(), error);
    }

    #[test]
    fn test_duplicate_correlation_id_is_rejected() {
        let pending = PendingRequests::default();
        let _rx = pending.register("7".to_string()).unwrap();
        assert!(matches!(
            pending.register("7".to_string()),
            Err(AmqpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reply_handler_maps_status() {
        let pending = Arc::new(PendingRequests::default());
        let mut ok = pending.register("1".to_string()).unwrap();
        let mut failed = pending.register("2".to_string()).unwrap();
        let mut handler = ReplyHandler {
            pending: pending.clone(),
            address: "$management".to_string(),
        };

        let deliver = |handler: &mut ReplyHandler, id: &str, status: i32| {
            let mut reply = AmqpMessage::new()
                .with_application_property(STATUS_CODE_KEY, status)
                .with_application_property(STATUS_DESCRIPTION_KEY, "Not Found");
            reply.properties.correlation_id = Some(id.to_string());
            handler.on_delivery(Delivery {
                delivery_id: 0,
                payload: reply.encode().unwrap(),
                settled: false,
            })
        };

        assert_eq!(deliver(&mut handler, "2", 404), 1);
        assert_eq!(deliver(&mut handler, "1", 200), 1);
        assert_eq!(deliver(&mut handler, "99", 200), 1);

        assert!(ok.try_recv().unwrap().is_ok());
        assert_eq!(
            failed.try_recv().unwrap(),
            Err(AmqpError::ServiceError {
                status_code: 404,
                description: "Not Found".to_string()
            })
        );
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_reply_without_status_is_a_protocol_error() {
        let reply = AmqpMessage::new();
        assert!(matches!(reply_status(&reply), Err(AmqpError::ProtocolError(_))));
    }
}
