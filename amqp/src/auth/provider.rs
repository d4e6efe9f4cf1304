use crate::common::AmqpResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Kind of token a provider issues, which decides the CBS `type` property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenType {
    /// Shared access signature produced from a shared key.
    SharedAccessSignature,
    /// Bearer token issued by an identity provider.
    Jwt,
}

impl TokenType {
    /// Value sent as the `type` application property of a `put-token` request.
    pub fn cbs_type(&self) -> &'static str {
        match self {
            TokenType::SharedAccessSignature => "servicebus.windows.net:sastoken",
            TokenType::Jwt => "jwt",
        }
    }
}

/// A bearer token valid for one audience until `expires_on`.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessToken {
    /// The opaque token string placed in the CBS request body
    pub token: String,
    pub token_type: TokenType,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_on
    }
}

/// Source of tokens presented to the broker through CBS.
///
/// Implementations must be cheap to call repeatedly; the token manager asks
/// for a token on every renewal tick.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::auth::{AccessToken, TokenProvider, TokenType};
/// use eventhubs_amqp::common::AmqpResult;
/// use async_trait::async_trait;
/// use std::time::Duration;
///
/// struct StaticToken(String);
///
/// #[async_trait]
/// impl TokenProvider for StaticToken {
///     async fn get_token(&self, _audience: &str, validity: Duration) -> AmqpResult<AccessToken> {
///         Ok(AccessToken {
///             token: self.0.clone(),
///             token_type: TokenType::Jwt,
///             expires_on: chrono::Utc::now() + validity,
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token for `audience` valid for at least `validity` where the
    /// provider can honour it.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidArgument`](crate::common::AmqpError::InvalidArgument)
    /// for a malformed audience and [`AmqpError::CryptoError`](crate::common::AmqpError::CryptoError)
    /// if signing fails.
    async fn get_token(&self, audience: &str, validity: Duration) -> AmqpResult<AccessToken>;
}
