use claims::{assert_err, assert_ok};
use eventhubs_amqp::auth::{SharedAccessKey, SharedAccessKeyCredential};
use eventhubs_amqp::common::{AmqpError, ErrorCondition};
use eventhubs_amqp::config::ConnectionOptions;
use eventhubs_amqp::connection::{Connection, ConnectionConfig};
use eventhubs_amqp::endpoint::EndpointState;
use eventhubs_amqp::event_loop::LoopState;
use eventhubs_amqp::message::AmqpMessage;
use eventhubs_amqp::transport::MemoryBroker;
use eventhubs_amqp::transport::memory::{EntityRecord, PartitionRecord};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

mod connection_helpers {
    use super::*;
    use chrono::{DateTime, Utc};

    pub fn broker_with_hub() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.handle().add_entity(EntityRecord {
            name: "hub1".to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            partitions: vec![PartitionRecord::empty("0")],
        });
        broker
    }

    pub fn config() -> ConnectionConfig {
        let credential = SharedAccessKeyCredential::new("send", SharedAccessKey::new("secret"));
        ConnectionConfig::new("ns.servicebus.windows.net", "hub1", Arc::new(credential))
    }

    pub fn open(broker: &MemoryBroker) -> Arc<Connection> {
        let _ = env_logger::builder().is_test(true).try_init();
        Connection::open(Box::new(broker.accept()), config()).expect("connection opens")
    }
}

use connection_helpers::*;

#[tokio::test]
async fn test_connection_negotiates_frame_size() {
    let broker = MemoryBroker::with_max_frame_size(8192);
    let connection = open(&broker);

    assert_ok!(connection.wait_active(WAIT).await);
    assert_eq!(connection.max_frame_size(), 8192);
    assert_eq!(connection.state(), EndpointState::Active);
    assert!(connection.properties().contains_key("user-agent"));

    connection.close().await;
}

#[tokio::test]
async fn test_concurrent_create_session_yields_one_session() {
    let broker = broker_with_hub();
    let connection = open(&broker);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.create_session("shared").await })
        })
        .collect();

    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap().unwrap());
    }

    let first = &sessions[0];
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, first)));
    assert_eq!(connection.session_count().await, 1);
    assert_ok!(first.wait_active(WAIT).await);

    connection.close().await;
}

#[tokio::test]
async fn test_close_stops_loop_and_closes_sessions() {
    let broker = broker_with_hub();
    let connection = open(&broker);
    let session = connection.create_session("s1").await.unwrap();
    session.wait_active(WAIT).await.unwrap();

    assert_ok!(connection.close_with_timeout(WAIT).await);
    assert_ok!(connection.close_with_timeout(WAIT).await);

    assert_eq!(connection.loop_state(), LoopState::Stopped);
    assert!(session.state().is_closed());
    assert_eq!(connection.state(), EndpointState::Closed(None));
    assert_err!(connection.create_session("s2").await);
}

#[tokio::test]
async fn test_send_link_delivers_to_entity() {
    let broker = broker_with_hub();
    let connection = open(&broker);
    let session = connection.create_session("producer").await.unwrap();

    let link = session.create_send_link("sender-1", "hub1").unwrap();
    assert_ok!(link.wait_active(WAIT).await);

    let message = AmqpMessage::new().with_body("hello");
    assert_ok!(link.send_settled(&message).await);
    // The broker handles frames in order, so the disposition implies both arrived.
    assert_ok!(link.send(&message).await);

    let stored = broker.handle().entity_messages("hub1");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].body, message.body);
    assert!(link.credit() > 0);

    connection.close().await;
}

#[tokio::test]
async fn test_link_to_unknown_address_is_refused() {
    let broker = broker_with_hub();
    let connection = open(&broker);
    let session = connection.create_session("s1").await.unwrap();

    let link = session.create_send_link("lost", "no-such-hub").unwrap();
    let err = link.wait_active(WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        AmqpError::TransportError { condition: ErrorCondition::NotFound, .. }
    ));

    let message = AmqpMessage::new().with_body("x");
    assert_err!(link.send(&message).await);
    connection.close().await;
}

#[tokio::test]
async fn test_session_close_detaches_links() {
    let broker = broker_with_hub();
    let connection = open(&broker);
    let session = connection.create_session("s1").await.unwrap();
    let link = session.create_send_link("sender-1", "hub1").unwrap();
    link.wait_active(WAIT).await.unwrap();

    session.close();
    let mut states = link.endpoint_states();
    assert_eq!(states.wait_closed().await, None);
    assert_err!(session.create_send_link("sender-2", "hub1"));

    connection.close().await;
}

#[tokio::test]
async fn test_closed_links_leave_session_table() {
    let broker = broker_with_hub();
    let connection = open(&broker);
    let session = connection.create_session("churn").await.unwrap();

    let kept = session.create_send_link("kept", "hub1").unwrap();
    kept.wait_active(WAIT).await.unwrap();
    for i in 0..5 {
        let link = session.create_send_link(&format!("short-{i}"), "hub1").unwrap();
        link.wait_active(WAIT).await.unwrap();
        link.close();
        assert_eq!(link.endpoint_states().wait_closed().await, None);
    }
    let refused = session.create_send_link("refused", "no-such-hub").unwrap();
    assert_err!(refused.wait_active(WAIT).await);

    let receiver = session
        .create_receive_link("detached", "hub1/ConsumerGroups/$default/Partitions/0")
        .unwrap();
    receiver.wait_active(WAIT).await.unwrap();
    broker.handle().detach_address(
        "hub1/ConsumerGroups/$default/Partitions/0",
        ErrorCondition::LinkDetachForced,
        "idle timeout",
    );
    assert!(receiver.endpoint_states().wait_closed().await.is_some());

    assert_eq!(session.link_count(), 1);
    assert!(kept.state().is_active());
    connection.close().await;
}

#[tokio::test]
async fn test_forced_detach_reaches_link() {
    let broker = broker_with_hub();
    let connection = open(&broker);
    let session = connection.create_session("s1").await.unwrap();
    let link = session
        .create_receive_link("receiver-1", "hub1/ConsumerGroups/$default/Partitions/0")
        .unwrap();
    link.wait_active(WAIT).await.unwrap();
    assert_eq!(link.credit(), ConnectionOptions::default().prefetch);

    broker.handle().detach_address(
        "hub1/ConsumerGroups/$default/Partitions/0",
        ErrorCondition::LinkDetachForced,
        "idle timeout",
    );

    let err = link.receive().await.unwrap_err();
    assert_eq!(
        err,
        AmqpError::transport(ErrorCondition::LinkDetachForced, "idle timeout")
    );
    assert_eq!(link.credit(), 0);
    connection.close().await;
}

#[tokio::test]
async fn test_fatal_close_fails_pending_requests_and_reports() {
    let broker = broker_with_hub();
    let reported = Arc::new(AtomicUsize::new(0));
    let counter = reported.clone();
    let config = config().with_error_handler(Arc::new(move |error: &AmqpError| {
        assert!(error.is_transport_error());
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let connection = Connection::open(Box::new(broker.accept()), config).unwrap();
    let management = connection.management_channel().await.unwrap();

    broker.handle().hold_replies(true);
    let pending = {
        let management = management.clone();
        tokio::spawn(async move { management.get_partition_properties("0").await })
    };
    while broker.handle().management_requests().is_empty() {
        tokio::task::yield_now().await;
    }

    broker
        .handle()
        .close_connections(ErrorCondition::ConnectionForced, "maintenance");

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        AmqpError::transport(ErrorCondition::ConnectionForced, "maintenance")
    );
    let mut states = connection.endpoint_states();
    assert!(states.wait_closed().await.is_some());
    assert!(connection.is_closed());
    assert_eq!(reported.load(Ordering::SeqCst), 1);
}
