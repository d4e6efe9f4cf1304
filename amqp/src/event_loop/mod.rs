//! Single-task executor that owns the transport and all protocol state.
//!
//! Callers never touch protocol state directly. They submit [`Command`]s
//! through a [`LoopHandle`]; the loop interleaves those with frames from the
//! peer, one step at a time, yielding to the runtime between steps.
//!
//! Lifecycle: `Idle -> Running -> Draining -> Stopped`. Draining starts when
//! [`EventLoopExecutor::close`] is called, the peer closes, or the transport
//! fails. It is bounded by the drain timeout: queued commands are failed,
//! endpoints are closed and the transport is released.

pub mod commands;
mod protocol;

pub use commands::{AttachRequest, Command, TransferOutcome};

use crate::common::{AmqpError, AmqpResult, ErrorCondition};
use crate::endpoint::EndpointStateTracker;
use crate::transport::{Frame, Transport};
use protocol::{FrameOutcome, ProtocolState};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Commands handled per step before the loop yields.
const MAX_COMMANDS_PER_STEP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Receives fatal connection errors, called from the loop task.
pub type ErrorHandler = Arc<dyn Fn(&AmqpError) + Send + Sync>;

/// Cloneable submission side of the loop.
#[derive(Clone)]
pub struct LoopHandle {
    commands: flume::Sender<Command>,
    state: watch::Receiver<LoopState>,
}

impl LoopHandle {
    /// Queues `command` for the loop.
    ///
    /// Fails with a disposed error once the loop is draining or stopped; the
    /// command's trackers and outcome slots are completed with that error.
    pub fn submit(&self, command: Command) -> AmqpResult<()> {
        let state = *self.state.borrow();
        if matches!(state, LoopState::Draining | LoopState::Stopped) {
            let error = AmqpError::disposed("Connection is closed");
            command.reject(&error);
            return Err(error);
        }
        self.commands.send(command).map_err(|flume::SendError(command)| {
            let error = AmqpError::disposed("Event loop has stopped");
            command.reject(&error);
            error
        })
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), LoopState::Draining | LoopState::Stopped)
    }
}

/// Parameters for the Open performative.
pub struct OpenParameters {
    pub container_id: String,
    pub hostname: String,
    pub max_frame_size: u32,
    pub properties: BTreeMap<String, String>,
}

struct LoopParts {
    transport: Box<dyn Transport>,
    commands: flume::Receiver<Command>,
    protocol: ProtocolState,
}

pub struct EventLoopExecutor {
    state: Arc<watch::Sender<LoopState>>,
    handle: LoopHandle,
    parts: Mutex<Option<LoopParts>>,
    drain_timeout: Duration,
    error_handler: Option<ErrorHandler>,
}

impl EventLoopExecutor {
    /// Builds an idle executor over `transport`.
    ///
    /// `connection` tracks the connection endpoint and `max_frame_size`
    /// receives the negotiated frame size once the peer's Open arrives.
    pub fn new(
        transport: Box<dyn Transport>,
        open: OpenParameters,
        connection: EndpointStateTracker,
        max_frame_size: Arc<AtomicU32>,
        drain_timeout: Duration,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);
        let (command_tx, command_rx) = flume::unbounded();
        let protocol = ProtocolState::new(
            open.container_id,
            open.hostname,
            open.max_frame_size,
            open.properties,
            max_frame_size,
            connection,
        );

        Self {
            state: Arc::new(state_tx),
            handle: LoopHandle {
                commands: command_tx,
                state: state_rx,
            },
            parts: Mutex::new(Some(LoopParts {
                transport,
                commands: command_rx,
                protocol,
            })),
            drain_timeout,
            error_handler,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Spawns the loop task. A second call logs a warning and does nothing.
    pub fn start(&self) -> bool {
        let parts = self
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(parts) = parts else {
            log::warn!("Event loop already started");
            return false;
        };

        let started = self.state.send_if_modified(|state| {
            if *state == LoopState::Idle {
                *state = LoopState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            log::warn!("Event loop cannot start from state {:?}", self.state());
            return false;
        }

        let runner = LoopRunner {
            transport: parts.transport,
            commands: parts.commands,
            protocol: parts.protocol,
            state: self.state.clone(),
            drain_timeout: self.drain_timeout,
            error_handler: self.error_handler.clone(),
        };
        tokio::spawn(runner.run());
        true
    }

    /// Requests shutdown. Idempotent and safe to call from any thread.
    pub fn close(&self) {
        let parts = self
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut parts) = parts {
            // Never started: nothing is on the wire, just release the endpoints.
            parts.protocol.close_all(None);
            let error = AmqpError::disposed("Connection closed before start");
            while let Ok(command) = parts.commands.try_recv() {
                command.reject(&error);
            }
            self.state.send_replace(LoopState::Stopped);
            return;
        }

        if self.state() == LoopState::Running {
            let _ = self.handle.commands.send(Command::Close);
        }
    }

    /// Waits until the loop has stopped.
    pub async fn wait_stopped(&self, timeout: Duration) -> AmqpResult<()> {
        let mut state = self.state.subscribe();
        tokio::time::timeout(timeout, state.wait_for(|state| *state == LoopState::Stopped))
            .await
            .map_err(|_| AmqpError::Timeout(format!("Event loop did not stop within {timeout:?}")))?
            .map(|_| ())
            .map_err(|_| AmqpError::disposed("Event loop state dropped"))
    }
}

impl Drop for EventLoopExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

enum Step {
    Continue,
    Stop,
    Fatal(AmqpError),
}

struct LoopRunner {
    transport: Box<dyn Transport>,
    commands: flume::Receiver<Command>,
    protocol: ProtocolState,
    state: Arc<watch::Sender<LoopState>>,
    drain_timeout: Duration,
    error_handler: Option<ErrorHandler>,
}

impl LoopRunner {
    async fn run(mut self) {
        let mut step = match self.protocol.open(self.transport.as_mut()).await {
            Ok(()) => Step::Continue,
            Err(e) => Step::Fatal(e),
        };

        while let Step::Continue = step {
            step = tokio::select! {
                command = self.commands.recv_async() => match command {
                    Ok(command) => self.execute(command).await,
                    Err(_) => Step::Stop,
                },
                frame = self.transport.recv() => self.on_frame(frame).await,
            };

            let mut handled = 0;
            while let Step::Continue = step {
                if handled == MAX_COMMANDS_PER_STEP {
                    break;
                }
                let Ok(command) = self.commands.try_recv() else {
                    break;
                };
                step = self.execute(command).await;
                handled += 1;
            }

            tokio::task::yield_now().await;
        }

        self.shutdown(step).await;
    }

    async fn execute(&mut self, command: Command) -> Step {
        if let Command::Close = command {
            return Step::Stop;
        }
        let name = command.name();
        match self.protocol.on_command(self.transport.as_mut(), command).await {
            Ok(()) => Step::Continue,
            Err(e) => {
                log::error!("Event loop failed to execute {name}: {e}");
                Step::Fatal(e)
            }
        }
    }

    async fn on_frame(&mut self, frame: AmqpResult<Option<Frame>>) -> Step {
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Step::Fatal(AmqpError::transport(
                    ErrorCondition::ConnectionForced,
                    "Transport closed by peer",
                ));
            }
            Err(e) => return Step::Fatal(e),
        };

        match self.protocol.on_frame(self.transport.as_mut(), frame).await {
            Ok(FrameOutcome::Continue) => Step::Continue,
            Ok(FrameOutcome::PeerClosed(error)) => Step::Fatal(error.unwrap_or_else(|| {
                AmqpError::transport(ErrorCondition::ConnectionForced, "Connection closed by peer")
            })),
            Err(e) => Step::Fatal(e),
        }
    }

    fn report(&self, error: &AmqpError) {
        if error.is_transient() {
            log::warn!("Connection failed with transient error: {error}");
        } else {
            log::error!("Connection failed: {error}");
        }
        if let Some(handler) = &self.error_handler {
            handler(error);
        }
    }

    async fn shutdown(mut self, step: Step) {
        let error = match step {
            Step::Fatal(error) => {
                self.report(&error);
                Some(error)
            }
            _ => None,
        };
        self.state.send_replace(LoopState::Draining);
        log::debug!(
            "Event loop draining ({} sessions, {} links)",
            self.protocol.session_count(),
            self.protocol.link_count()
        );

        let reject = error
            .clone()
            .unwrap_or_else(|| AmqpError::disposed("Connection is closing"));
        let local_close = error.is_none();
        let drain_timeout = self.drain_timeout;
        if tokio::time::timeout(drain_timeout, self.drain(local_close, &reject))
            .await
            .is_err()
        {
            log::warn!("Event loop drain did not finish within {drain_timeout:?}");
        }

        self.protocol.close_all(error);
        while let Ok(command) = self.commands.try_recv() {
            command.reject(&reject);
        }
        if let Err(e) = self.transport.close().await {
            log::debug!("Error while closing transport: {e}");
        }
        self.state.send_replace(LoopState::Stopped);
        log::debug!("Event loop stopped");
    }

    async fn drain(&mut self, local_close: bool, reject: &AmqpError) {
        while let Ok(command) = self.commands.try_recv() {
            command.reject(reject);
        }
        if !local_close {
            return;
        }

        match self.protocol.send_close(self.transport.as_mut()).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                log::debug!("Could not send Close: {e}");
                return;
            }
        }
        loop {
            match self.transport.recv().await {
                Ok(Some(Frame::Close { .. })) | Ok(None) | Err(_) => return,
                Ok(Some(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointState;
    use crate::transport::{MemoryBroker, MemoryTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_parameters() -> OpenParameters {
        OpenParameters {
            container_id: "client".to_string(),
            hostname: "ns.servicebus.windows.net".to_string(),
            max_frame_size: 65_536,
            properties: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_close_stops() {
        let broker = MemoryBroker::with_max_frame_size(16_384);
        let (tracker, mut states) = EndpointStateTracker::new();
        let max = Arc::new(AtomicU32::new(0));
        let executor = EventLoopExecutor::new(
            Box::new(broker.accept()),
            open_parameters(),
            tracker,
            max.clone(),
            Duration::from_secs(1),
            None,
        );

        assert!(executor.start());
        assert!(!executor.start());
        states.wait_active().await.unwrap();
        assert_eq!(max.load(Ordering::Acquire), 16_384);

        executor.close();
        executor.close();
        executor.wait_stopped(Duration::from_secs(1)).await.unwrap();
        assert_eq!(executor.state(), LoopState::Stopped);
        assert_eq!(states.current(), EndpointState::Closed(None));
        assert!(executor.handle().is_closed());
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_error() {
        let (client, peer) = MemoryTransport::pair();
        let (tracker, mut states) = EndpointStateTracker::new();
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        let handler: ErrorHandler = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let executor = EventLoopExecutor::new(
            Box::new(client),
            open_parameters(),
            tracker,
            Arc::new(AtomicU32::new(0)),
            Duration::from_secs(1),
            Some(handler),
        );
        executor.start();
        drop(peer);

        let error = states.wait_closed().await.unwrap();
        assert!(error.is_transport_error());
        executor.wait_stopped(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_close_is_rejected() {
        let (client, _peer) = MemoryTransport::pair();
        let (tracker, _states) = EndpointStateTracker::new();
        let executor = EventLoopExecutor::new(
            Box::new(client),
            open_parameters(),
            tracker,
            Arc::new(AtomicU32::new(0)),
            Duration::from_millis(50),
            None,
        );
        executor.close();

        let (session, mut session_states) = EndpointStateTracker::new();
        let result = executor.handle().submit(Command::BeginSession {
            channel: 0,
            tracker: session,
        });
        assert!(result.is_err());
        assert!(session_states.wait_active().await.is_err());
    }
}
