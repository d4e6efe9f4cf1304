use async_trait::async_trait;
use claims::{assert_err, assert_ok};
use eventhubs_amqp::auth::{
    AccessToken, AuthorizationOutcome, TokenManager, TokenProvider, TokenType,
};
use eventhubs_amqp::common::{AmqpError, AmqpResult};
use eventhubs_amqp::config::ConnectionOptions;
use eventhubs_amqp::connection::{CBS_SESSION_NAME, Connection, ConnectionConfig};
use eventhubs_amqp::scheduler::TokioScheduler;
use eventhubs_amqp::transport::MemoryBroker;
use std::sync::Arc;
use std::time::Duration;

const AUDIENCE: &str = "amqp://ns.servicebus.windows.net/hub1";
const VALIDITY: Duration = Duration::from_secs(1200);

// Helper module for authorization flow testing
mod auth_flow_helpers {
    use super::*;
    use chrono::Utc;

    /// Issues a fixed bearer token, as an identity provider would.
    pub struct StaticJwtProvider;

    #[async_trait]
    impl TokenProvider for StaticJwtProvider {
        async fn get_token(&self, _audience: &str, validity: Duration) -> AmqpResult<AccessToken> {
            Ok(AccessToken {
                token: "eyJhbGciOi.static.jwt".to_string(),
                token_type: TokenType::Jwt,
                expires_on: Utc::now()
                    + chrono::Duration::from_std(validity)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            })
        }
    }

    pub fn sas_config() -> ConnectionConfig {
        ConnectionConfig::from_connection_string(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0;EntityPath=hub1",
        )
        .expect("valid connection string")
    }

    pub fn open(broker: &MemoryBroker, config: ConnectionConfig) -> Arc<Connection> {
        Connection::open(Box::new(broker.accept()), config).expect("connection opens")
    }
}

use auth_flow_helpers::*;

#[tokio::test]
async fn test_put_token_accepted() {
    let broker = MemoryBroker::new();
    let connection = open(&broker, sas_config());
    assert_eq!(connection.audience(), AUDIENCE);

    let cbs = connection.authorization_channel().await.unwrap();
    let status = cbs.authorize(AUDIENCE, VALIDITY).await.unwrap();
    assert_eq!(status, 202);

    let requests = broker.handle().put_tokens();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].audience, AUDIENCE);
    assert_eq!(requests[0].token_type, "servicebus.windows.net:sastoken");
    assert!(requests[0].token.starts_with("SharedAccessSignature sr="));
    assert!(requests[0].token.contains("&skn=RootManageSharedAccessKey"));

    connection.close().await;
}

#[tokio::test]
async fn test_put_token_rejected_with_status() {
    let broker = MemoryBroker::new();
    broker.handle().set_cbs_status(401, "Unauthorized");
    let connection = open(&broker, sas_config());

    let cbs = connection.authorization_channel().await.unwrap();
    let err = cbs.authorize(AUDIENCE, VALIDITY).await.unwrap_err();
    assert_eq!(
        err,
        AmqpError::AuthorizationFailure {
            status_code: 401,
            description: "Unauthorized".to_string()
        }
    );

    // The channel itself is still usable after a rejected token.
    broker.handle().clear_cbs_status();
    assert_ok!(cbs.authorize(AUDIENCE, VALIDITY).await);
    connection.close().await;
}

#[tokio::test]
async fn test_jwt_tokens_use_jwt_type() {
    let broker = MemoryBroker::new();
    let config = ConnectionConfig::new(
        "ns.servicebus.windows.net",
        "hub1",
        Arc::new(StaticJwtProvider),
    );
    let connection = open(&broker, config);

    let status = eventhubs_amqp::auth::ClaimsAuthorizer::authorize(
        connection.as_ref(),
        AUDIENCE,
        VALIDITY,
    )
    .await
    .unwrap();
    assert_eq!(status, 202);
    assert_eq!(broker.handle().put_tokens()[0].token_type, "jwt");

    connection.close().await;
}

#[tokio::test]
async fn test_authorization_channel_is_created_once() {
    let broker = MemoryBroker::new();
    let connection = open(&broker, sas_config());

    let (a, b) = tokio::join!(
        connection.authorization_channel(),
        connection.authorization_channel()
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(connection.session_count().await, 1);
    assert!(connection.session(CBS_SESSION_NAME).await.is_some());

    a.close().await;
    assert!(a.is_closed());
    assert!(connection.session(CBS_SESSION_NAME).await.is_none());
    assert_err!(a.authorize(AUDIENCE, VALIDITY).await);

    connection.close().await;
}

#[tokio::test]
async fn test_token_manager_renews_over_connection() {
    let broker = MemoryBroker::new();
    let connection = open(&broker, sas_config());
    let manager = TokenManager::new(
        connection.clone(),
        connection.audience(),
        Duration::from_millis(400),
        Duration::from_millis(100),
        Arc::new(TokioScheduler::new(2)),
    )
    .unwrap();
    let outcomes = manager.subscribe();

    assert_eq!(manager.authorize().await.unwrap(), 202);
    tokio::time::sleep(Duration::from_millis(350)).await;
    manager.close().await;

    let received: Vec<AuthorizationOutcome> = outcomes.drain().collect();
    assert!(received.len() >= 3, "expected renewals, got {received:?}");
    assert!(
        received
            .iter()
            .all(|o| *o == AuthorizationOutcome::Authorized { status_code: 202 })
    );
    assert!(broker.handle().put_tokens().len() >= received.len());

    connection.close().await;
}

#[tokio::test]
async fn test_token_manager_publishes_failures_and_stops_on_close() {
    let broker = MemoryBroker::new();
    broker.handle().set_cbs_status(401, "Unauthorized");
    let connection = open(&broker, sas_config());
    let manager = TokenManager::with_defaults(
        connection.clone(),
        connection.audience(),
        Arc::new(TokioScheduler::new(1)),
    )
    .unwrap();
    let outcomes = manager.subscribe();

    let err = manager.authorize().await.unwrap_err();
    assert_eq!(err.status_code(), Some(401));
    assert_eq!(
        outcomes.recv_async().await.unwrap(),
        AuthorizationOutcome::Failed(err)
    );

    manager.close().await;
    assert!(outcomes.recv_async().await.is_err());
    assert_err!(manager.authorize().await);

    connection.close().await;
}

#[tokio::test]
async fn test_token_manager_follows_connection_options() {
    let broker = MemoryBroker::new();
    let options = ConnectionOptions {
        token_validity_secs: 3,
        token_refresh_secs: 1,
        max_concurrent_timers: 2,
        ..ConnectionOptions::default()
    };
    let connection = open(&broker, sas_config().with_options(options));
    let scheduler = Arc::new(TokioScheduler::from_options(connection.options()));
    assert_eq!(scheduler.available_permits(), 2);

    let manager =
        TokenManager::for_connection(&connection, connection.audience(), scheduler).unwrap();
    assert_eq!(manager.validity(), Duration::from_secs(3));
    assert_eq!(manager.refresh_interval(), Duration::from_secs(1));

    assert_ok!(manager.authorize().await);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    manager.close().await;

    assert!(broker.handle().put_tokens().len() >= 2);
    connection.close().await;
}
