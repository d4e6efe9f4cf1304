use crate::common::{AmqpError, AmqpResult};
use crate::endpoint::EndpointStateTracker;
use crate::link::DeliveryHandler;
use crate::transport::{ChannelId, Handle, Role};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use tokio::sync::oneshot;

/// Resolves once a transfer is written (pre-settled) or settled by the peer.
pub type TransferOutcome = oneshot::Sender<AmqpResult<()>>;

/// Everything the loop needs to attach a link.
pub struct AttachRequest {
    pub channel: ChannelId,
    pub handle: Handle,
    pub name: String,
    pub role: Role,
    pub source: String,
    pub target: String,
    pub tracker: EndpointStateTracker,
    /// Receive side only: credit granted once the peer confirms the attach.
    pub initial_credit: u32,
    /// Shared snapshot of the link credit, written only by the loop.
    pub credit: Arc<AtomicU32>,
    pub handler: Option<Box<dyn DeliveryHandler>>,
}

/// Requests handed from callers to the event loop.
pub enum Command {
    BeginSession {
        channel: ChannelId,
        tracker: EndpointStateTracker,
    },
    EndSession {
        channel: ChannelId,
    },
    AttachLink(Box<AttachRequest>),
    DetachLink {
        handle: Handle,
    },
    Transfer {
        handle: Handle,
        payload: Vec<u8>,
        settled: bool,
        outcome: Option<TransferOutcome>,
    },
    AddCredit {
        handle: Handle,
        credit: u32,
    },
    Close,
}

impl Command {
    /// Completes the command without executing it, used while draining.
    pub(crate) fn reject(self, error: &AmqpError) {
        match self {
            Command::BeginSession { tracker, .. } => {
                tracker.close(Some(error.clone()));
            }
            Command::AttachLink(request) => {
                let AttachRequest {
                    tracker, handler, ..
                } = *request;
                tracker.close(Some(error.clone()));
                if let Some(mut handler) = handler {
                    handler.on_closed(Some(error));
                }
            }
            Command::Transfer {
                outcome: Some(outcome),
                ..
            } => {
                let _ = outcome.send(Err(error.clone()));
            }
            _ => {}
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::BeginSession { .. } => "begin-session",
            Command::EndSession { .. } => "end-session",
            Command::AttachLink(_) => "attach-link",
            Command::DetachLink { .. } => "detach-link",
            Command::Transfer { .. } => "transfer",
            Command::AddCredit { .. } => "add-credit",
            Command::Close => "close",
        }
    }
}
