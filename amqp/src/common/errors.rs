use std::fmt;
use thiserror::Error;

/// AMQP error conditions carried by transport-level failures.
///
/// These map to the symbolic error conditions a peer attaches to `Detach`,
/// `End` and `Close` frames, plus [`ErrorCondition::Disposed`] which is raised
/// locally when an endpoint is used after it has been closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    /// `amqp:connection:forced`
    ConnectionForced,
    /// `amqp:link:detach-forced`
    LinkDetachForced,
    /// `amqp:not-found`
    NotFound,
    /// `amqp:unauthorized-access`
    UnauthorizedAccess,
    /// `amqp:internal-error`
    InternalError,
    /// `amqp:resource-limit-exceeded`
    ResourceLimitExceeded,
    /// The local endpoint has been closed.
    Disposed,
    /// Any other condition symbol reported by the peer.
    Other(String),
}

impl ErrorCondition {
    /// Parses a condition symbol as it appears on the wire.
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "amqp:connection:forced" => ErrorCondition::ConnectionForced,
            "amqp:link:detach-forced" => ErrorCondition::LinkDetachForced,
            "amqp:not-found" => ErrorCondition::NotFound,
            "amqp:unauthorized-access" => ErrorCondition::UnauthorizedAccess,
            "amqp:internal-error" => ErrorCondition::InternalError,
            "amqp:resource-limit-exceeded" => ErrorCondition::ResourceLimitExceeded,
            "local:disposed" => ErrorCondition::Disposed,
            other => ErrorCondition::Other(other.to_string()),
        }
    }

    /// The symbol used on the wire for this condition.
    pub fn symbol(&self) -> &str {
        match self {
            ErrorCondition::ConnectionForced => "amqp:connection:forced",
            ErrorCondition::LinkDetachForced => "amqp:link:detach-forced",
            ErrorCondition::NotFound => "amqp:not-found",
            ErrorCondition::UnauthorizedAccess => "amqp:unauthorized-access",
            ErrorCondition::InternalError => "amqp:internal-error",
            ErrorCondition::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            ErrorCondition::Disposed => "local:disposed",
            ErrorCondition::Other(symbol) => symbol,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Errors produced by the AMQP core.
///
/// The variants follow a small taxonomy that tells the caller what kind of
/// failure happened and how far it reaches:
///
/// ## Caller input
/// - [`InvalidArgument`] - malformed input to a pure function (token
///   generation, connection-string parsing, a request that already carries
///   an id). Never retried.
/// - [`CryptoError`] - the HMAC primitive could not be constructed.
///
/// ## Reply status
/// - [`AuthorizationFailure`] - the CBS node answered a `put-token` with a
///   non-success status code.
/// - [`ServiceError`] - a management or other request-response peer answered
///   with a non-success status code.
/// - [`ProtocolError`] - a reply did not have the expected shape. Fails only
///   the request it belongs to.
///
/// ## Connection health
/// - [`TransportError`] - the connection, session or link reported a fatal
///   error. Every pending request on the affected channel fails with it and
///   the connection error handler is notified.
/// - [`Timeout`] - the caller's wait elapsed. Local to the caller; the
///   channel is unaffected.
///
/// No operation in this crate retries on its own. Use [`AmqpError::is_transient`]
/// to decide whether a higher layer should.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::common::{AmqpError, ErrorCondition};
///
/// fn describe(error: &AmqpError) {
///     match error {
///         AmqpError::AuthorizationFailure { status_code, description } => {
///             log::warn!("CBS rejected the token: {status_code} {description}");
///         }
///         AmqpError::TransportError { condition, .. } if *condition == ErrorCondition::Disposed => {
///             log::debug!("Endpoint already closed");
///         }
///         other if other.is_transient() => log::info!("Transient failure: {other}"),
///         other => log::error!("Failure: {other}"),
///     }
/// }
/// ```
///
/// [`InvalidArgument`]: AmqpError::InvalidArgument
/// [`CryptoError`]: AmqpError::CryptoError
/// [`AuthorizationFailure`]: AmqpError::AuthorizationFailure
/// [`ServiceError`]: AmqpError::ServiceError
/// [`ProtocolError`]: AmqpError::ProtocolError
/// [`TransportError`]: AmqpError::TransportError
/// [`Timeout`]: AmqpError::Timeout
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AmqpError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Authorization failed with status {status_code}: {description}")]
    AuthorizationFailure {
        status_code: i32,
        description: String,
    },

    #[error("Service returned status {status_code}: {description}")]
    ServiceError {
        status_code: i32,
        description: String,
    },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Transport error ({condition}): {description}")]
    TransportError {
        condition: ErrorCondition,
        description: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl AmqpError {
    pub fn transport(condition: ErrorCondition, description: impl Into<String>) -> Self {
        AmqpError::TransportError {
            condition,
            description: description.into(),
        }
    }

    /// Error used when an operation targets an endpoint that has been closed.
    pub fn disposed(description: impl Into<String>) -> Self {
        Self::transport(ErrorCondition::Disposed, description)
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(self, AmqpError::TransportError { .. })
    }

    /// Whether a higher layer may reasonably retry the failed operation.
    ///
    /// Timeouts and transport failures (other than use-after-close) are
    /// transient; a 5xx-class service status is transient; everything else
    /// needs a change of input or credentials first.
    pub fn is_transient(&self) -> bool {
        match self {
            AmqpError::Timeout(_) => true,
            AmqpError::TransportError { condition, .. } => !matches!(
                condition,
                ErrorCondition::Disposed
                    | ErrorCondition::UnauthorizedAccess
                    | ErrorCondition::NotFound
            ),
            AmqpError::ServiceError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    /// Status code carried by a reply-status failure, if any.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            AmqpError::AuthorizationFailure { status_code, .. }
            | AmqpError::ServiceError { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for AmqpError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AmqpError::Timeout(err.to_string())
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::ProtocolError(format!("Failed to decode payload: {err}"))
    }
}

// Result type alias for convenience
pub type AmqpResult<T> = Result<T, AmqpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_symbol_round_trip() {
        for condition in [
            ErrorCondition::ConnectionForced,
            ErrorCondition::LinkDetachForced,
            ErrorCondition::NotFound,
            ErrorCondition::UnauthorizedAccess,
            ErrorCondition::Disposed,
        ] {
            assert_eq!(ErrorCondition::from_symbol(condition.symbol()), condition);
        }
        assert_eq!(
            ErrorCondition::from_symbol("com.microsoft:server-busy"),
            ErrorCondition::Other("com.microsoft:server-busy".to_string())
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AmqpError::Timeout("slow".into()).is_transient());
        assert!(AmqpError::transport(ErrorCondition::ConnectionForced, "gone").is_transient());
        assert!(!AmqpError::disposed("closed").is_transient());
        assert!(!AmqpError::InvalidArgument("bad".into()).is_transient());
        assert!(
            AmqpError::ServiceError {
                status_code: 503,
                description: "busy".into()
            }
            .is_transient()
        );
        assert!(
            !AmqpError::AuthorizationFailure {
                status_code: 401,
                description: "Unauthorized".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_authorization_failure_display() {
        let err = AmqpError::AuthorizationFailure {
            status_code: 401,
            description: "Unauthorized".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Authorization failed with status 401: Unauthorized"
        );
        assert_eq!(err.status_code(), Some(401));
    }
}
