//! The physical connection and its session registry.

use crate::auth::connection_string::ConnectionStringProperties;
use crate::auth::shared_access_key::SharedAccessKeyCredential;
use crate::auth::token_manager::ClaimsAuthorizer;
use crate::auth::TokenProvider;
use crate::channels::cbs::{CbsChannel, entity_audience};
use crate::channels::management::ManagementChannel;
use crate::common::{AmqpError, AmqpResult};
use crate::config::{CONNECTION_STRING_ENV, ConnectionOptions};
use crate::endpoint::{EndpointState, EndpointStateTracker, EndpointStates};
use crate::event_loop::{ErrorHandler, EventLoopExecutor, LoopHandle, LoopState, OpenParameters};
use crate::session::Session;
use crate::transport::{ChannelId, Transport, TransportFactory};
use crate::utils::EnvUtils;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

/// Name of the session that carries the CBS channel.
pub const CBS_SESSION_NAME: &str = "cbs-session";
/// Name of the session that carries the management channel.
pub const MANAGEMENT_SESSION_NAME: &str = "mgmt-session";

/// Everything needed to open a [`Connection`].
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub entity_path: String,
    pub token_provider: Arc<dyn TokenProvider>,
    pub options: ConnectionOptions,
    pub error_handler: Option<ErrorHandler>,
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        entity_path: impl Into<String>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            host: host.into(),
            entity_path: entity_path.into(),
            token_provider,
            options: ConnectionOptions::default(),
            error_handler: None,
        }
    }

    /// Builds a config authenticated with the shared access key in
    /// `connection_string`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use eventhubs_amqp::connection::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::from_connection_string(
    ///     "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=abc=;EntityPath=hub1",
    /// )?;
    /// assert_eq!(config.host, "ns.servicebus.windows.net");
    /// # Ok::<(), eventhubs_amqp::AmqpError>(())
    /// ```
    pub fn from_connection_string(connection_string: &str) -> AmqpResult<Self> {
        let properties = ConnectionStringProperties::parse(connection_string)?;
        let credential = SharedAccessKeyCredential::from_connection_string(&properties);
        Ok(Self::new(
            properties.host(),
            properties.entity_path(),
            Arc::new(credential),
        ))
    }

    /// Reads the connection string from `EVENTHUBS_CONNECTION_STRING` and
    /// options from the other `EVENTHUBS_*` variables.
    pub fn from_env() -> AmqpResult<Self> {
        let connection_string = EnvUtils::get_validated_var(CONNECTION_STRING_ENV)
            .map_err(|e| AmqpError::InvalidArgument(e.to_string()))?;
        let options =
            ConnectionOptions::from_env().map_err(|e| AmqpError::InvalidArgument(e.to_string()))?;
        options.validate()?;
        Ok(Self::from_connection_string(&connection_string)?.with_options(options))
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }
}

fn connection_properties() -> BTreeMap<String, String> {
    let product = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    let platform = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);
    let user_agent = format!("{product}/{version} ({platform})");

    BTreeMap::from([
        ("product".to_string(), product.to_string()),
        ("version".to_string(), version.to_string()),
        ("platform".to_string(), platform),
        ("user-agent".to_string(), user_agent),
    ])
}

/// One AMQP connection to a namespace host.
///
/// Owns the event loop, the named session registry and the lazily created
/// CBS and management channels. Always handled through an `Arc`; sessions
/// keep a weak reference back to it.
pub struct Connection {
    id: String,
    host: String,
    entity_path: String,
    options: ConnectionOptions,
    properties: BTreeMap<String, String>,
    token_provider: Arc<dyn TokenProvider>,
    executor: EventLoopExecutor,
    loop_handle: LoopHandle,
    states: EndpointStates,
    max_frame_size: Arc<AtomicU32>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    next_channel: AtomicU16,
    next_handle: Arc<AtomicU32>,
    cbs: OnceCell<Arc<CbsChannel>>,
    management: OnceCell<Arc<ManagementChannel>>,
    closing: AtomicBool,
    this: Weak<Connection>,
}

impl Connection {
    /// Opens a connection over `transport` and starts its event loop.
    pub fn open(transport: Box<dyn Transport>, config: ConnectionConfig) -> AmqpResult<Arc<Self>> {
        config.options.validate()?;
        if config.host.is_empty() {
            return Err(AmqpError::InvalidArgument("Host cannot be empty".to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let properties = connection_properties();
        let (tracker, states) = EndpointStateTracker::new();
        let max_frame_size = Arc::new(AtomicU32::new(config.options.max_frame_size));

        let executor = EventLoopExecutor::new(
            transport,
            OpenParameters {
                container_id: id.clone(),
                hostname: config.host.clone(),
                max_frame_size: config.options.max_frame_size,
                properties: properties.clone(),
            },
            tracker,
            max_frame_size.clone(),
            config.options.drain_timeout(),
            config.error_handler.clone(),
        );
        let loop_handle = executor.handle();

        let connection = Arc::new_cyclic(|this| Connection {
            id,
            host: config.host,
            entity_path: config.entity_path,
            options: config.options,
            properties,
            token_provider: config.token_provider,
            executor,
            loop_handle,
            states,
            max_frame_size,
            sessions: Mutex::new(HashMap::new()),
            next_channel: AtomicU16::new(0),
            next_handle: Arc::new(AtomicU32::new(0)),
            cbs: OnceCell::new(),
            management: OnceCell::new(),
            closing: AtomicBool::new(false),
            this: this.clone(),
        });

        connection.executor.start();
        log::info!("Opened connection {} to {}", connection.id, connection.host);
        Ok(connection)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// `amqp://<host>/<entity path>`, the audience tokens are issued for.
    pub fn audience(&self) -> String {
        entity_audience(&self.host, &self.entity_path)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn token_provider(&self) -> Arc<dyn TokenProvider> {
        self.token_provider.clone()
    }

    /// Local max frame size until the peer's Open arrives, then the
    /// negotiated one.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::Acquire)
    }

    pub fn endpoint_states(&self) -> EndpointStates {
        self.states.clone()
    }

    pub fn state(&self) -> EndpointState {
        self.states.current()
    }

    pub fn loop_state(&self) -> LoopState {
        self.executor.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.loop_handle.is_closed()
    }

    /// Waits for the peer's Open.
    pub async fn wait_active(&self, timeout: Duration) -> AmqpResult<()> {
        self.states.clone().wait_active_timeout(timeout).await
    }

    fn arc(&self) -> AmqpResult<Arc<Connection>> {
        self.this
            .upgrade()
            .ok_or_else(|| AmqpError::disposed("Connection has been dropped"))
    }

    /// Returns the open session called `name`, creating it if needed.
    ///
    /// Concurrent callers asking for the same name get the same session.
    pub async fn create_session(&self, name: &str) -> AmqpResult<Arc<Session>> {
        if name.is_empty() {
            return Err(AmqpError::InvalidArgument("Session name cannot be empty".to_string()));
        }
        let mut sessions = self.sessions.lock().await;
        if self.is_closed() {
            return Err(AmqpError::disposed(format!("Connection {} is closed", self.id)));
        }
        if let Some(session) = sessions.get(name) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }

        let channel: ChannelId = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::open(
            name.to_string(),
            channel,
            self.this.clone(),
            self.loop_handle.clone(),
            self.next_handle.clone(),
            self.options.prefetch,
        )?);
        sessions.insert(name.to_string(), session.clone());
        Ok(session)
    }

    pub async fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(name).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Closes and forgets the session called `name`. Returns whether it existed.
    pub async fn remove_session(&self, name: &str) -> bool {
        let removed = self.sessions.lock().await.remove(name);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// The CBS channel, created on first use.
    pub async fn authorization_channel(&self) -> AmqpResult<Arc<CbsChannel>> {
        self.cbs
            .get_or_try_init(|| async {
                let connection = self.arc()?;
                CbsChannel::open(&connection).await.map(Arc::new)
            })
            .await
            .cloned()
    }

    /// The management channel, created on first use.
    pub async fn management_channel(&self) -> AmqpResult<Arc<ManagementChannel>> {
        self.management
            .get_or_try_init(|| async {
                let connection = self.arc()?;
                ManagementChannel::open(&connection).await.map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Closes channels and sessions, then stops the event loop, waiting up to
    /// the drain timeout plus a second.
    pub async fn close(&self) {
        let timeout = self.options.drain_timeout() + Duration::from_secs(1);
        if let Err(e) = self.close_with_timeout(timeout).await {
            log::warn!("Connection {} did not stop cleanly: {e}", self.id);
        }
    }

    /// [`close`](Self::close) with an explicit bound on the wait.
    pub async fn close_with_timeout(&self, timeout: Duration) -> AmqpResult<()> {
        if !self.closing.swap(true, Ordering::AcqRel) {
            log::info!("Closing connection {}", self.id);
            if let Some(cbs) = self.cbs.get() {
                cbs.close().await;
            }
            if let Some(management) = self.management.get() {
                management.close().await;
            }
            let sessions: Vec<Arc<Session>> =
                self.sessions.lock().await.drain().map(|(_, s)| s).collect();
            for session in sessions {
                session.close();
            }
            self.executor.close();
        }
        self.executor.wait_stopped(timeout).await
    }
}

#[async_trait]
impl ClaimsAuthorizer for Connection {
    async fn authorize(&self, audience: &str, validity: Duration) -> AmqpResult<i32> {
        self.authorization_channel()
            .await?
            .authorize(audience, validity)
            .await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("state", &self.states.current())
            .finish()
    }
}

/// Hands out a live [`Connection`], creating one on first use and replacing
/// it once it has closed. Failures are returned to the caller; nothing is
/// retried here.
pub struct ConnectionProcessor {
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    current: Mutex<Option<Arc<Connection>>>,
    closed: AtomicBool,
}

impl ConnectionProcessor {
    pub fn new(factory: Arc<dyn TransportFactory>, config: ConnectionConfig) -> Self {
        Self {
            factory,
            config,
            current: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn get_connection(&self) -> AmqpResult<Arc<Connection>> {
        let mut current = self.current.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::disposed("Connection processor is closed"));
        }
        if let Some(connection) = current.as_ref() {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            log::info!("Connection {} is closed, opening a new one", connection.id());
        }

        let transport = self.factory.connect(&self.config.host).await?;
        let connection = Connection::open(transport, self.config.clone())?;
        *current = Some(connection.clone());
        Ok(connection)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connection = self.current.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }
}
