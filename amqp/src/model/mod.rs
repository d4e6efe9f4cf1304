//! Entity and partition metadata returned by the management node.

use crate::common::{AmqpError, AmqpResult};
use crate::message::AmqpValue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::TryFrom;

/// Runtime information about an event hub.
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct EventHubProperties {
    /// Name of the event hub
    pub name: String,
    /// When the event hub was created
    pub created_at: DateTime<Utc>,
    /// Identifiers of every partition, in the order the service lists them
    pub partition_ids: Vec<String>,
}

/// Runtime information about one partition of an event hub.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::model::PartitionProperties;
///
/// fn describe(properties: &PartitionProperties) -> String {
///     if properties.is_empty() {
///         format!("partition {} has no events", properties.id)
///     } else {
///         format!(
///             "partition {} holds sequence numbers {}..={}",
///             properties.id,
///             properties.begin_sequence_number,
///             properties.last_enqueued_sequence_number
///         )
///     }
/// }
/// ```
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct PartitionProperties {
    /// Name of the event hub the partition belongs to
    pub event_hub_name: String,
    /// Partition identifier
    pub id: String,
    /// First sequence number still retained
    pub begin_sequence_number: i64,
    /// Sequence number of the most recently enqueued event
    pub last_enqueued_sequence_number: i64,
    /// Offset of the most recently enqueued event
    pub last_enqueued_offset: String,
    /// When the most recent event was enqueued
    pub last_enqueued_time_utc: DateTime<Utc>,
    pub is_partition_empty: bool,
}

impl PartitionProperties {
    /// Whether the partition currently holds no events.
    pub fn is_empty(&self) -> bool {
        self.is_partition_empty
    }
}

/// Typed access to a management reply body.
struct ReplyMap<'a> {
    map: &'a BTreeMap<String, AmqpValue>,
}

impl<'a> ReplyMap<'a> {
    fn new(body: &'a AmqpValue) -> AmqpResult<Self> {
        body.as_map().map(|map| Self { map }).ok_or_else(|| {
            AmqpError::ProtocolError(format!(
                "Expected a map in the management reply, got {}",
                body.type_name()
            ))
        })
    }

    fn get(&self, key: &str) -> AmqpResult<&'a AmqpValue> {
        self.map
            .get(key)
            .ok_or_else(|| AmqpError::ProtocolError(format!("Management reply is missing '{key}'")))
    }

    fn mismatch(key: &str, expected: &str, value: &AmqpValue) -> AmqpError {
        AmqpError::ProtocolError(format!(
            "Management reply field '{key}' should be {expected}, got {}",
            value.type_name()
        ))
    }

    fn string(&self, key: &str) -> AmqpResult<String> {
        let value = self.get(key)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Self::mismatch(key, "a string", value))
    }

    fn long(&self, key: &str) -> AmqpResult<i64> {
        let value = self.get(key)?;
        value
            .as_i64()
            .ok_or_else(|| Self::mismatch(key, "an integer", value))
    }

    fn boolean(&self, key: &str) -> AmqpResult<bool> {
        let value = self.get(key)?;
        value
            .as_bool()
            .ok_or_else(|| Self::mismatch(key, "a boolean", value))
    }

    fn timestamp(&self, key: &str) -> AmqpResult<DateTime<Utc>> {
        match self.get(key)? {
            AmqpValue::Timestamp(millis) => DateTime::<Utc>::from_timestamp_millis(*millis)
                .ok_or_else(|| {
                    AmqpError::ProtocolError(format!("Timestamp '{key}' is out of range"))
                }),
            other => Err(Self::mismatch(key, "a timestamp", other)),
        }
    }

    fn string_list(&self, key: &str) -> AmqpResult<Vec<String>> {
        match self.get(key)? {
            AmqpValue::List(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Self::mismatch(key, "a list of strings", item))
                })
                .collect(),
            other => Err(Self::mismatch(key, "a list", other)),
        }
    }
}

impl TryFrom<&AmqpValue> for EventHubProperties {
    type Error = AmqpError;

    fn try_from(body: &AmqpValue) -> Result<Self, Self::Error> {
        let reply = ReplyMap::new(body)?;
        Ok(Self {
            name: reply.string("name")?,
            created_at: reply.timestamp("created_at")?,
            partition_ids: reply.string_list("partition_ids")?,
        })
    }
}

impl TryFrom<&AmqpValue> for PartitionProperties {
    type Error = AmqpError;

    fn try_from(body: &AmqpValue) -> Result<Self, Self::Error> {
        let reply = ReplyMap::new(body)?;
        Ok(Self {
            event_hub_name: reply.string("name")?,
            id: reply.string("partition")?,
            begin_sequence_number: reply.long("begin_sequence_number")?,
            last_enqueued_sequence_number: reply.long("last_enqueued_sequence_number")?,
            last_enqueued_offset: reply.string("last_enqueued_offset")?,
            last_enqueued_time_utc: reply.timestamp("last_enqueued_time_utc")?,
            is_partition_empty: reply.boolean("is_partition_empty")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition_body() -> BTreeMap<String, AmqpValue> {
        BTreeMap::from([
            ("name".to_string(), AmqpValue::from("hub1")),
            ("partition".to_string(), AmqpValue::from("0")),
            ("begin_sequence_number".to_string(), AmqpValue::Long(10)),
            ("last_enqueued_sequence_number".to_string(), AmqpValue::Long(42)),
            ("last_enqueued_offset".to_string(), AmqpValue::from("4096")),
            (
                "last_enqueued_time_utc".to_string(),
                AmqpValue::Timestamp(1_700_000_000_000),
            ),
            ("is_partition_empty".to_string(), AmqpValue::Bool(false)),
        ])
    }

    #[test]
    fn test_partition_properties_from_reply() {
        let properties = PartitionProperties::try_from(&AmqpValue::Map(partition_body())).unwrap();
        assert_eq!(properties.event_hub_name, "hub1");
        assert_eq!(properties.id, "0");
        assert_eq!(properties.last_enqueued_sequence_number, 42);
        assert_eq!(properties.last_enqueued_time_utc.timestamp(), 1_700_000_000);
        assert!(!properties.is_empty());
    }

    #[test]
    fn test_wrong_field_type_is_a_protocol_error() {
        let mut body = partition_body();
        body.insert("is_partition_empty".to_string(), AmqpValue::from("yes"));

        let err = PartitionProperties::try_from(&AmqpValue::Map(body)).unwrap_err();
        assert!(matches!(err, AmqpError::ProtocolError(msg) if msg.contains("is_partition_empty")));
    }

    #[test]
    fn test_entity_properties_require_a_map() {
        let err = EventHubProperties::try_from(&AmqpValue::from("garbage")).unwrap_err();
        assert!(matches!(err, AmqpError::ProtocolError(_)));
    }

    #[test]
    fn test_entity_properties_from_reply() {
        let body = AmqpValue::Map(BTreeMap::from([
            ("name".to_string(), AmqpValue::from("hub1")),
            ("created_at".to_string(), AmqpValue::Timestamp(0)),
            (
                "partition_ids".to_string(),
                AmqpValue::List(vec![AmqpValue::from("0"), AmqpValue::from("1")]),
            ),
        ]));
        let properties = EventHubProperties::try_from(&body).unwrap();
        assert_eq!(properties.partition_ids, vec!["0", "1"]);
        assert_eq!(properties.created_at, DateTime::<Utc>::UNIX_EPOCH);
    }
}
