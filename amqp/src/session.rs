//! Sessions multiplex links over one connection channel.

use crate::common::{AmqpError, AmqpResult};
use crate::connection::Connection;
use crate::endpoint::{EndpointState, EndpointStateTracker, EndpointStates};
use crate::event_loop::{AttachRequest, Command, LoopHandle};
use crate::link::{ChannelDeliveryHandler, DeliveryHandler, ReceiveLink, SendLink};
use crate::transport::{ChannelId, Handle, Role};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// A named session on a [`Connection`].
///
/// The session is begun when it is constructed and stays usable until
/// [`Session::close`] or until the peer ends it. Links created through it are
/// detached when it closes.
pub struct Session {
    name: String,
    channel: ChannelId,
    connection: Weak<Connection>,
    loop_handle: LoopHandle,
    states: EndpointStates,
    next_handle: Arc<AtomicU32>,
    prefetch: u32,
    /// Links created here that have not closed yet, by handle.
    links: Mutex<BTreeMap<Handle, TrackedLink>>,
    closing: AtomicBool,
}

struct TrackedLink {
    name: String,
    states: EndpointStates,
}

impl Session {
    pub(crate) fn open(
        name: String,
        channel: ChannelId,
        connection: Weak<Connection>,
        loop_handle: LoopHandle,
        next_handle: Arc<AtomicU32>,
        prefetch: u32,
    ) -> AmqpResult<Self> {
        let (tracker, states) = EndpointStateTracker::new();
        loop_handle.submit(Command::BeginSession { channel, tracker })?;
        log::debug!("Beginning session '{name}' on channel {channel}");

        Ok(Self {
            name,
            channel,
            connection,
            loop_handle,
            states,
            next_handle,
            prefetch,
            links: Mutex::new(BTreeMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The owning connection, if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn endpoint_states(&self) -> EndpointStates {
        self.states.clone()
    }

    pub fn state(&self) -> EndpointState {
        self.states.current()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.states.current().is_closed()
    }

    pub async fn wait_active(&self, timeout: Duration) -> AmqpResult<()> {
        self.states.clone().wait_active_timeout(timeout).await
    }

    /// Number of links on this session that are not closed.
    pub fn link_count(&self) -> usize {
        self.lock_links().len()
    }

    /// Locks the link table, dropping links that have closed since.
    fn lock_links(&self) -> MutexGuard<'_, BTreeMap<Handle, TrackedLink>> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.retain(|_, link| !link.states.current().is_closed());
        links
    }

    fn ensure_open(&self) -> AmqpResult<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(AmqpError::disposed(format!("Session '{}' is closed", self.name)));
        }
        if let EndpointState::Closed(error) = self.states.current() {
            return Err(error.unwrap_or_else(|| {
                AmqpError::disposed(format!("Session '{}' is closed", self.name))
            }));
        }
        Ok(())
    }

    fn attach(
        &self,
        name: &str,
        role: Role,
        source: String,
        target: String,
        initial_credit: u32,
        handler: Option<Box<dyn DeliveryHandler>>,
    ) -> AmqpResult<(Handle, EndpointStates, Arc<AtomicU32>)> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(AmqpError::InvalidArgument("Link name cannot be empty".to_string()));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let (tracker, states) = EndpointStateTracker::new();
        let credit = Arc::new(AtomicU32::new(0));

        self.loop_handle
            .submit(Command::AttachLink(Box::new(AttachRequest {
                channel: self.channel,
                handle,
                name: name.to_string(),
                role,
                source,
                target,
                tracker,
                initial_credit,
                credit: credit.clone(),
                handler,
            })))?;
        self.lock_links().insert(
            handle,
            TrackedLink {
                name: name.to_string(),
                states: states.clone(),
            },
        );
        log::debug!(
            "Attaching {role:?} link '{name}' on session '{}' (handle {handle})",
            self.name
        );
        Ok((handle, states, credit))
    }

    /// Attaches a link sending to `target`.
    pub fn create_send_link(&self, name: &str, target: &str) -> AmqpResult<SendLink> {
        let (handle, states, credit) = self.attach(
            name,
            Role::Sender,
            name.to_string(),
            target.to_string(),
            0,
            None,
        )?;
        Ok(SendLink::new(
            name.to_string(),
            target.to_string(),
            handle,
            self.loop_handle.clone(),
            states,
            credit,
        ))
    }

    /// Attaches a link receiving from `source` into an internal queue,
    /// prefetching up to the connection's prefetch count.
    pub fn create_receive_link(&self, name: &str, source: &str) -> AmqpResult<ReceiveLink> {
        let (handler, deliveries) = ChannelDeliveryHandler::new();
        let (handle, states, credit) = self.attach(
            name,
            Role::Receiver,
            source.to_string(),
            name.to_string(),
            self.prefetch,
            Some(Box::new(handler)),
        )?;
        Ok(ReceiveLink::new(
            name.to_string(),
            source.to_string(),
            handle,
            self.loop_handle.clone(),
            states,
            credit,
            Some(deliveries),
        ))
    }

    /// Attaches a link receiving from `source` whose deliveries are handled
    /// on the event loop by `handler`. `target` is the local address the peer
    /// routes to.
    pub fn create_receive_link_with_handler(
        &self,
        name: &str,
        source: &str,
        target: &str,
        initial_credit: u32,
        handler: Box<dyn DeliveryHandler>,
    ) -> AmqpResult<ReceiveLink> {
        let (handle, states, credit) = self.attach(
            name,
            Role::Receiver,
            source.to_string(),
            target.to_string(),
            initial_credit,
            Some(handler),
        )?;
        Ok(ReceiveLink::new(
            name.to_string(),
            source.to_string(),
            handle,
            self.loop_handle.clone(),
            states,
            credit,
            None,
        ))
    }

    /// Detaches every link created on this session, then ends it. Idempotent.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let links = std::mem::take(&mut *self.lock_links());
        if self.loop_handle.is_closed() {
            return;
        }

        for (handle, link) in links {
            if let Err(e) = self.loop_handle.submit(Command::DetachLink { handle }) {
                log::debug!("Could not detach link '{}': {e}", link.name);
            }
        }
        if let Err(e) = self.loop_handle.submit(Command::EndSession {
            channel: self.channel,
        }) {
            log::debug!("Could not end session '{}': {e}", self.name);
        }
        log::debug!("Session '{}' closed", self.name);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("state", &self.states.current())
            .finish()
    }
}
