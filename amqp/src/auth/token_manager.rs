use crate::common::{AmqpError, AmqpResult};
use crate::config::{DEFAULT_TOKEN_REFRESH_INTERVAL, DEFAULT_TOKEN_VALIDITY};
use crate::connection::Connection;
use crate::events::EventStream;
use crate::scheduler::{PeriodicTask, ScheduledTask, Scheduler};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Presents claims for an audience to the broker.
///
/// Implemented by the CBS channel and by a connection, which forwards to its
/// CBS channel.
#[async_trait]
pub trait ClaimsAuthorizer: Send + Sync {
    /// Returns the broker's status code on success.
    async fn authorize(&self, audience: &str, validity: Duration) -> AmqpResult<i32>;
}

/// Result of one authorization attempt, published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationOutcome {
    Authorized { status_code: i32 },
    Failed(AmqpError),
}

struct TokenManagerInner {
    authorizer: Arc<dyn ClaimsAuthorizer>,
    audience: String,
    validity: Duration,
    refresh_interval: Duration,
    scheduler: Arc<dyn Scheduler>,
    outcomes: EventStream<AuthorizationOutcome>,
    /// Closed flag. Held across an authorization so close cannot interleave.
    gate: tokio::sync::Mutex<bool>,
    cancel_token: CancellationToken,
    renewal: Mutex<Option<ScheduledTask>>,
}

impl TokenManagerInner {
    async fn authorize_once(&self) -> AmqpResult<i32> {
        let closed = self.gate.lock().await;
        if *closed {
            return Err(AmqpError::disposed("Token manager is closed"));
        }

        let result = tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => {
                return Err(AmqpError::disposed("Token manager is closed"));
            }
            result = self.authorizer.authorize(&self.audience, self.validity) => result,
        };

        let outcome = match &result {
            Ok(status_code) => {
                log::debug!("Authorized {} (status {status_code})", self.audience);
                AuthorizationOutcome::Authorized {
                    status_code: *status_code,
                }
            }
            Err(e) => {
                log::warn!("Failed to authorize {}: {e}", self.audience);
                AuthorizationOutcome::Failed(e.clone())
            }
        };
        self.outcomes.publish(outcome);
        drop(closed);
        result
    }

    fn stop(&self) {
        self.cancel_token.cancel();
        let renewal = self
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(renewal) = renewal {
            renewal.cancel();
        }
    }
}

/// Keeps an audience authorized by re-presenting a token on a fixed
/// interval, shorter than the token validity.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::auth::TokenManager;
/// use eventhubs_amqp::scheduler::TokioScheduler;
/// use std::sync::Arc;
///
/// # async fn example(connection: Arc<eventhubs_amqp::connection::Connection>) -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Arc::new(TokioScheduler::from_options(connection.options()));
/// let manager = TokenManager::for_connection(&connection, connection.audience(), scheduler)?;
/// let outcomes = manager.subscribe();
/// manager.authorize().await?;
/// # Ok(())
/// # }
/// ```
pub struct TokenManager {
    inner: Arc<TokenManagerInner>,
}

impl TokenManager {
    /// # Errors
    ///
    /// `InvalidArgument` if `audience` is empty, either duration is zero, or
    /// `refresh_interval` is not shorter than `validity`.
    pub fn new(
        authorizer: Arc<dyn ClaimsAuthorizer>,
        audience: impl Into<String>,
        validity: Duration,
        refresh_interval: Duration,
        scheduler: Arc<dyn Scheduler>,
    ) -> AmqpResult<Self> {
        let audience = audience.into();
        if audience.is_empty() {
            return Err(AmqpError::InvalidArgument("Audience cannot be empty".to_string()));
        }
        if validity.is_zero() || refresh_interval.is_zero() {
            return Err(AmqpError::InvalidArgument(
                "Token validity and refresh interval must be positive".to_string(),
            ));
        }
        if refresh_interval >= validity {
            return Err(AmqpError::InvalidArgument(format!(
                "Refresh interval {refresh_interval:?} must be shorter than token validity {validity:?}"
            )));
        }

        Ok(Self {
            inner: Arc::new(TokenManagerInner {
                authorizer,
                audience,
                validity,
                refresh_interval,
                scheduler,
                outcomes: EventStream::new(),
                gate: tokio::sync::Mutex::new(false),
                cancel_token: CancellationToken::new(),
                renewal: Mutex::new(None),
            }),
        })
    }

    /// Validity 20 minutes, renewal every 5 minutes.
    pub fn with_defaults(
        authorizer: Arc<dyn ClaimsAuthorizer>,
        audience: impl Into<String>,
        scheduler: Arc<dyn Scheduler>,
    ) -> AmqpResult<Self> {
        Self::new(
            authorizer,
            audience,
            DEFAULT_TOKEN_VALIDITY,
            DEFAULT_TOKEN_REFRESH_INTERVAL,
            scheduler,
        )
    }

    /// Authorizes through `connection` with the validity and refresh
    /// interval from its [`ConnectionOptions`](crate::config::ConnectionOptions).
    pub fn for_connection(
        connection: &Arc<Connection>,
        audience: impl Into<String>,
        scheduler: Arc<dyn Scheduler>,
    ) -> AmqpResult<Self> {
        let options = connection.options();
        Self::new(
            connection.clone(),
            audience,
            options.token_validity(),
            options.token_refresh_interval(),
            scheduler,
        )
    }

    pub fn audience(&self) -> &str {
        &self.inner.audience
    }

    pub fn validity(&self) -> Duration {
        self.inner.validity
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    /// Outcomes of every authorization from now on.
    pub fn subscribe(&self) -> flume::Receiver<AuthorizationOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Authorizes now and, on success, starts periodic renewal if it is not
    /// running yet. Returns the broker's status code.
    pub async fn authorize(&self) -> AmqpResult<i32> {
        let status_code = self.inner.authorize_once().await?;
        self.start_renewal();
        Ok(status_code)
    }

    fn start_renewal(&self) {
        let mut renewal = self
            .inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if renewal.is_some() || self.inner.cancel_token.is_cancelled() {
            return;
        }

        let weak: Weak<TokenManagerInner> = Arc::downgrade(&self.inner);
        let tick: PeriodicTask = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                // Failures are published to subscribers; the next tick retries.
                let _ = inner.authorize_once().await;
            })
        });

        log::debug!(
            "Renewing authorization for {} every {:?}",
            self.inner.audience,
            self.inner.refresh_interval
        );
        *renewal = Some(
            self.inner
                .scheduler
                .schedule_periodic(self.inner.refresh_interval, tick),
        );
    }

    pub fn is_renewing(&self) -> bool {
        self.inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_cancelled())
    }

    /// Stops renewal and completes the outcome stream. A renewal racing with
    /// close publishes nothing. Idempotent.
    pub async fn close(&self) {
        self.inner.stop();
        let mut closed = self.inner.gate.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        self.inner.outcomes.complete();
        log::debug!("Token manager for {} closed", self.inner.audience);
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.inner.stop();
        self.inner.outcomes.complete();
    }
}
