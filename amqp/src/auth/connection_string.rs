use crate::common::{AmqpError, AmqpResult};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const ENDPOINT_KEY: &str = "Endpoint";
const KEY_NAME_KEY: &str = "SharedAccessKeyName";
const KEY_KEY: &str = "SharedAccessKey";
const ENTITY_PATH_KEY: &str = "EntityPath";

/// A shared access key, wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedAccessKey(String);

impl SharedAccessKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SharedAccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedAccessKey(***)")
    }
}

/// Components of an Event Hubs connection string.
///
/// # Connection String Format
///
/// Semicolon-delimited `Key=Value` pairs. All four keys are required:
///
/// - `Endpoint` - namespace endpoint, e.g. `sb://my-namespace.servicebus.windows.net/`
/// - `SharedAccessKeyName` - name of the shared access policy
/// - `SharedAccessKey` - the policy's key
/// - `EntityPath` - the event hub name
///
/// Keys are matched case-insensitively; unknown keys are ignored.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::auth::ConnectionStringProperties;
///
/// let props = ConnectionStringProperties::parse(
///     "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=abc;EntityPath=hub1",
/// )?;
/// assert_eq!(props.host(), "ns.servicebus.windows.net");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStringProperties {
    endpoint: String,
    host: String,
    shared_access_key_name: String,
    shared_access_key: SharedAccessKey,
    entity_path: String,
}

impl ConnectionStringProperties {
    /// Parses a connection string.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidArgument`] if the string is empty, a segment
    /// is not a `Key=Value` pair, a required key is missing or empty, or the
    /// endpoint has no host.
    pub fn parse(connection_string: &str) -> AmqpResult<Self> {
        if connection_string.trim().is_empty() {
            return Err(AmqpError::InvalidArgument(
                "Connection string cannot be empty".to_string(),
            ));
        }

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (name, value) = part.split_once('=').ok_or_else(|| {
                AmqpError::InvalidArgument(format!(
                    "Connection string segment '{part}' is not a Key=Value pair"
                ))
            })?;
            let value = value.trim();

            if name.eq_ignore_ascii_case(ENDPOINT_KEY) {
                endpoint = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(KEY_NAME_KEY) {
                key_name = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(KEY_KEY) {
                key = Some(SharedAccessKey::new(value));
            } else if name.eq_ignore_ascii_case(ENTITY_PATH_KEY) {
                entity_path = Some(value.to_string());
            } else {
                log::debug!("Ignoring unknown connection string key '{name}'");
            }
        }

        let endpoint = Self::required(endpoint, ENDPOINT_KEY)?;
        let shared_access_key_name = Self::required(key_name, KEY_NAME_KEY)?;
        let entity_path = Self::required(entity_path, ENTITY_PATH_KEY)?;
        let shared_access_key = key
            .filter(|k| !k.expose().is_empty())
            .ok_or_else(|| Self::missing(KEY_KEY))?;

        let host = Self::host_from_endpoint(&endpoint)?;

        Ok(Self {
            endpoint,
            host,
            shared_access_key_name,
            shared_access_key,
            entity_path,
        })
    }

    fn required(value: Option<String>, key: &str) -> AmqpResult<String> {
        value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Self::missing(key))
    }

    fn missing(key: &str) -> AmqpError {
        AmqpError::InvalidArgument(format!("Missing {key} in connection string"))
    }

    // "sb://namespace.servicebus.windows.net/" -> "namespace.servicebus.windows.net"
    fn host_from_endpoint(endpoint: &str) -> AmqpResult<String> {
        let (_, rest) = endpoint.split_once("://").ok_or_else(|| {
            AmqpError::InvalidArgument(format!("Endpoint '{endpoint}' is not an absolute URI"))
        })?;
        let host = rest.split(['/', ':']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(AmqpError::InvalidArgument(format!(
                "Endpoint '{endpoint}' has no host"
            )));
        }
        Ok(host.to_string())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn shared_access_key_name(&self) -> &str {
        &self.shared_access_key_name
    }

    pub fn shared_access_key(&self) -> &SharedAccessKey {
        &self.shared_access_key
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }
}
