//! Claims-based-security authorization over the `$cbs` node.

use super::request_response::{RequestResponseChannel, reply_status};
use crate::auth::TokenProvider;
use crate::auth::token_manager::ClaimsAuthorizer;
use crate::common::{AmqpError, AmqpResult};
use crate::connection::{CBS_SESSION_NAME, Connection};
use crate::message::AmqpMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Address of the claims-based-security node.
pub const CBS_ADDRESS: &str = "$cbs";

pub const PUT_TOKEN_OPERATION: &str = "put-token";

/// Audience of an entity: `amqp://<host>/<entity path>`.
pub fn entity_audience(host: &str, entity_path: &str) -> String {
    format!("amqp://{host}/{entity_path}")
}

/// Builds the `put-token` request presenting `token` for `audience`.
pub fn put_token_request(audience: &str, token_type: &str, token: &str) -> AmqpMessage {
    AmqpMessage::new()
        .with_application_property("operation", PUT_TOKEN_OPERATION)
        .with_application_property("type", token_type)
        .with_application_property("name", audience)
        .with_body(token)
}

/// Authorization channel bound to a connection's `cbs-session`.
pub struct CbsChannel {
    channel: RequestResponseChannel,
    token_provider: Arc<dyn TokenProvider>,
    operation_timeout: Duration,
}

impl CbsChannel {
    pub async fn open(connection: &Arc<Connection>) -> AmqpResult<Self> {
        let channel =
            RequestResponseChannel::open(connection, CBS_SESSION_NAME, CBS_ADDRESS).await?;
        Ok(Self {
            channel,
            token_provider: connection.token_provider(),
            operation_timeout: connection.options().operation_timeout(),
        })
    }

    /// Obtains a token for `audience` and presents it to the broker.
    /// Returns the reply status code on success.
    ///
    /// # Errors
    ///
    /// `AuthorizationFailure` when the broker rejects the token; token
    /// provider and transport errors are passed through.
    pub async fn authorize(&self, audience: &str, validity: Duration) -> AmqpResult<i32> {
        let token = self.token_provider.get_token(audience, validity).await?;
        let request = put_token_request(audience, token.token_type.cbs_type(), &token.token);

        let reply = self
            .channel
            .send_with_timeout(request, self.operation_timeout)
            .await
            .map_err(|e| match e {
                AmqpError::ServiceError {
                    status_code,
                    description,
                } => AmqpError::AuthorizationFailure {
                    status_code,
                    description,
                },
                other => other,
            })?;

        let (status_code, _) = reply_status(&reply)?;
        log::debug!("Authorized {audience} (status {status_code})");
        Ok(status_code)
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

#[async_trait]
impl ClaimsAuthorizer for CbsChannel {
    async fn authorize(&self, audience: &str, validity: Duration) -> AmqpResult<i32> {
        CbsChannel::authorize(self, audience, validity).await
    }
}
