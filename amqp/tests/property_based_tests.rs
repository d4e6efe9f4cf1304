use chrono::{TimeZone, Utc};
use eventhubs_amqp::auth::{ConnectionStringProperties, SasTokenGenerator};
use eventhubs_amqp::endpoint::EndpointState;
use proptest::prelude::*;
use std::time::Duration;

#[cfg(test)]
mod sas_token_property_tests {
    use super::*;

    proptest! {
        #[test]
        fn test_generation_is_deterministic_for_fixed_clock(
            key_name in "[A-Za-z][A-Za-z0-9]{0,20}",
            key in "[A-Za-z0-9+/=]{1,44}",
            entity in "[a-z][a-z0-9-]{0,30}",
            ttl_secs in 1u64..86_400,
            now_secs in 1_600_000_000i64..1_900_000_000
        ) {
            let now = Utc.timestamp_opt(now_secs, 0).unwrap();
            let audience = format!("amqp://ns.servicebus.windows.net/{entity}");
            let ttl = Duration::from_secs(ttl_secs);

            let first = SasTokenGenerator::generate_at(&key_name, &key, &audience, ttl, now).unwrap();
            let second = SasTokenGenerator::generate_at(&key_name, &key, &audience, ttl, now).unwrap();

            // Property: same inputs at the same instant give the same token
            prop_assert_eq!(&first, &second);
            prop_assert!(first.starts_with("SharedAccessSignature sr="));

            // Property: the expiry is exactly now + ttl
            let expiry = SasTokenGenerator::parse_expiry(&first).unwrap();
            prop_assert_eq!(expiry.timestamp(), now_secs + ttl_secs as i64);
        }

        #[test]
        fn test_different_keys_give_different_signatures(
            key_a in "[A-Za-z0-9]{8,32}",
            key_b in "[A-Za-z0-9]{8,32}"
        ) {
            prop_assume!(key_a != key_b);
            let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            let ttl = Duration::from_secs(3600);
            let audience = "amqp://ns.servicebus.windows.net/hub1";

            let a = SasTokenGenerator::generate_at("name", &key_a, audience, ttl, now).unwrap();
            let b = SasTokenGenerator::generate_at("name", &key_b, audience, ttl, now).unwrap();
            prop_assert_ne!(a, b);
        }
    }
}

#[cfg(test)]
mod connection_string_property_tests {
    use super::*;

    proptest! {
        #[test]
        fn test_parse_round_trips_fields(
            namespace in "[a-z][a-z0-9]{2,20}",
            key_name in "[A-Za-z][A-Za-z0-9]{0,20}",
            key in "[A-Za-z0-9+/]{4,40}=?",
            entity in "[a-z][a-z0-9-]{0,30}"
        ) {
            let connection_string = format!(
                "Endpoint=sb://{namespace}.servicebus.windows.net/;SharedAccessKeyName={key_name};SharedAccessKey={key};EntityPath={entity}"
            );
            let properties = ConnectionStringProperties::parse(&connection_string).unwrap();

            let expected_host = format!("{namespace}.servicebus.windows.net");
            prop_assert_eq!(properties.host(), expected_host.as_str());
            prop_assert_eq!(properties.shared_access_key_name(), key_name.as_str());
            prop_assert_eq!(properties.shared_access_key().expose(), key.as_str());
            prop_assert_eq!(properties.entity_path(), entity.as_str());
        }

        #[test]
        fn test_missing_field_is_rejected(drop_index in 0usize..4) {
            let mut parts = vec![
                "Endpoint=sb://ns.servicebus.windows.net/",
                "SharedAccessKeyName=name",
                "SharedAccessKey=key",
                "EntityPath=hub1",
            ];
            parts.remove(drop_index);
            prop_assert!(ConnectionStringProperties::parse(&parts.join(";")).is_err());
        }
    }
}

#[cfg(test)]
mod endpoint_state_property_tests {
    use super::*;
    use eventhubs_amqp::endpoint::EndpointStateTracker;

    fn state_strategy() -> impl Strategy<Value = EndpointState> {
        prop_oneof![
            Just(EndpointState::Uninitialized),
            Just(EndpointState::Active),
            Just(EndpointState::Closed(None)),
        ]
    }

    proptest! {
        #[test]
        fn test_closed_is_reported_once(transitions in prop::collection::vec(state_strategy(), 0..20)) {
            let (tracker, states) = EndpointStateTracker::new();
            let mut terminal_transitions = 0;

            for next in transitions {
                let was_closed = tracker.current().is_closed();
                if tracker.transition(next) && tracker.current().is_closed() {
                    prop_assert!(!was_closed);
                    terminal_transitions += 1;
                }
            }

            // Property: at most one terminal state is ever published
            prop_assert!(terminal_transitions <= 1);
            prop_assert_eq!(states.current(), tracker.current());
        }
    }
}

#[cfg(test)]
mod correlation_property_tests {
    use super::*;
    use chrono::DateTime;
    use eventhubs_amqp::channels::RequestResponseChannel;
    use eventhubs_amqp::channels::management::MANAGEMENT_ADDRESS;
    use eventhubs_amqp::connection::{Connection, ConnectionConfig};
    use eventhubs_amqp::message::AmqpMessage;
    use eventhubs_amqp::transport::MemoryBroker;
    use eventhubs_amqp::transport::memory::{EntityRecord, PartitionRecord};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn run_requests(count: usize, reverse: bool) -> (Vec<String>, Vec<String>) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let broker = MemoryBroker::new();
            broker.handle().add_entity(EntityRecord {
                name: "hub1".to_string(),
                created_at: DateTime::<Utc>::UNIX_EPOCH,
                partitions: (0..count).map(|i| PartitionRecord::empty(i.to_string())).collect(),
            });
            let config = ConnectionConfig::from_connection_string(
                "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=n;SharedAccessKey=k;EntityPath=hub1",
            )
            .unwrap();
            let connection = Connection::open(Box::new(broker.accept()), config).unwrap();
            let channel = Arc::new(
                RequestResponseChannel::open(&connection, "rr-prop", MANAGEMENT_ADDRESS)
                    .await
                    .unwrap(),
            );

            broker.handle().hold_replies(true);
            let tasks: Vec<_> = (0..count)
                .map(|i| {
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        let request = AmqpMessage::new()
                            .with_application_property("operation", "READ")
                            .with_application_property("type", "com.microsoft:partition")
                            .with_application_property("name", "hub1")
                            .with_application_property("partition", i.to_string())
                            .with_application_property("security_token", "token");
                        let reply = channel.send(request).await.unwrap();
                        let body = reply.body.as_map().unwrap();
                        (i.to_string(), body["partition"].as_str().unwrap().to_string())
                    })
                })
                .collect();

            while broker.handle().management_requests().len() < count {
                tokio::task::yield_now().await;
            }
            broker.handle().release_held_replies(reverse);

            let mut asked = Vec::new();
            let mut answered = Vec::new();
            for task in tasks {
                let (a, b) = task.await.unwrap();
                asked.push(a);
                answered.push(b);
            }

            let ids: HashSet<String> = broker
                .handle()
                .management_requests()
                .iter()
                .filter_map(|r| r.properties.message_id.clone())
                .collect();
            assert_eq!(ids.len(), count, "correlation ids must be unique");

            connection.close().await;
            (asked, answered)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn test_each_caller_gets_its_own_reply(count in 1usize..16, reverse in any::<bool>()) {
            let (asked, answered) = run_requests(count, reverse);
            prop_assert_eq!(asked, answered);
        }
    }
}
