//! AMQP message model used on links and by the request-response channels.
//!
//! Messages are serialized to bytes before they are handed to the event loop
//! and decoded again on the receiving side, so a delivery's payload is the
//! only thing that crosses the transport.

use crate::common::{AmqpError, AmqpResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value in an application-properties map or a message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum AmqpValue {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    ULong(u64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Binary(Vec<u8>),
    List(Vec<AmqpValue>),
    Map(BTreeMap<String, AmqpValue>),
}

impl AmqpValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmqpValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of any integral variant that fits in `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AmqpValue::Int(v) => Some(i64::from(*v)),
            AmqpValue::Long(v) => Some(*v),
            AmqpValue::ULong(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmqpValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AmqpValue>> {
        match self {
            AmqpValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the variant, used in protocol error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AmqpValue::Null => "null",
            AmqpValue::Bool(_) => "bool",
            AmqpValue::Int(_) => "int",
            AmqpValue::Long(_) => "long",
            AmqpValue::ULong(_) => "ulong",
            AmqpValue::String(_) => "string",
            AmqpValue::Timestamp(_) => "timestamp",
            AmqpValue::Binary(_) => "binary",
            AmqpValue::List(_) => "list",
            AmqpValue::Map(_) => "map",
        }
    }
}

impl From<&str> for AmqpValue {
    fn from(value: &str) -> Self {
        AmqpValue::String(value.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(value: String) -> Self {
        AmqpValue::String(value)
    }
}

impl From<i32> for AmqpValue {
    fn from(value: i32) -> Self {
        AmqpValue::Int(value)
    }
}

impl From<i64> for AmqpValue {
    fn from(value: i64) -> Self {
        AmqpValue::Long(value)
    }
}

impl From<bool> for AmqpValue {
    fn from(value: bool) -> Self {
        AmqpValue::Bool(value)
    }
}

/// The immutable "properties" section of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
}

/// An AMQP message: properties, application properties and a body.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::message::AmqpMessage;
///
/// let request = AmqpMessage::new()
///     .with_application_property("operation", "READ")
///     .with_body("payload");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmqpMessage {
    pub properties: MessageProperties,
    pub application_properties: BTreeMap<String, AmqpValue>,
    pub body: AmqpValue,
}

impl AmqpMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<AmqpValue>,
    ) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<AmqpValue>) -> Self {
        self.body = body.into();
        self
    }

    pub fn application_property(&self, key: &str) -> Option<&AmqpValue> {
        self.application_properties.get(key)
    }

    /// Serializes the message into a delivery payload.
    pub fn encode(&self) -> AmqpResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| AmqpError::InvalidArgument(format!("Failed to encode message: {e}")))
    }

    /// Decodes a delivery payload.
    pub fn decode(payload: &[u8]) -> AmqpResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_views() {
        assert_eq!(AmqpValue::Int(202).as_i64(), Some(202));
        assert_eq!(AmqpValue::Long(-1).as_i64(), Some(-1));
        assert_eq!(AmqpValue::ULong(u64::MAX).as_i64(), None);
        assert_eq!(AmqpValue::String("202".into()).as_i64(), None);
    }

    #[test]
    fn test_new_message_has_null_body() {
        let message = AmqpMessage::new();
        assert_eq!(message.body, AmqpValue::Null);
        assert!(message.application_properties.is_empty());
        assert!(message.properties.message_id.is_none());
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let result = AmqpMessage::decode(b"not a message");
        assert!(matches!(result, Err(AmqpError::ProtocolError(_))));
    }

    #[test]
    fn test_builder_sets_properties_and_body() {
        let message = AmqpMessage::new()
            .with_application_property("operation", "put-token")
            .with_body("token");
        assert_eq!(
            message.application_property("operation"),
            Some(&AmqpValue::String("put-token".to_string()))
        );
        assert_eq!(message.body.as_str(), Some("token"));

        let decoded = AmqpMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}
