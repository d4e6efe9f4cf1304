//! Connection configuration.
//!
//! [`ConnectionOptions`] carries every tunable the AMQP core uses. Values can
//! come from code, from a JSON document, or from `EVENTHUBS_*` environment
//! variables; unspecified fields keep their defaults.

use crate::common::{AmqpError, AmqpResult};
use crate::utils::{EnvUtils, EnvVarError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the namespace connection string.
pub const CONNECTION_STRING_ENV: &str = "EVENTHUBS_CONNECTION_STRING";

const MAX_FRAME_SIZE_ENV: &str = "EVENTHUBS_MAX_FRAME_SIZE";
const OPERATION_TIMEOUT_ENV: &str = "EVENTHUBS_OPERATION_TIMEOUT_SECS";
const TOKEN_VALIDITY_ENV: &str = "EVENTHUBS_TOKEN_VALIDITY_SECS";
const TOKEN_REFRESH_ENV: &str = "EVENTHUBS_TOKEN_REFRESH_SECS";
const DRAIN_TIMEOUT_ENV: &str = "EVENTHUBS_DRAIN_TIMEOUT_SECS";
const PREFETCH_ENV: &str = "EVENTHUBS_PREFETCH";

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65_536;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PREFETCH: u32 = 100;
pub const DEFAULT_MAX_CONCURRENT_TIMERS: usize = 16;

/// Tunables for a [`Connection`](crate::connection::Connection).
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::config::ConnectionOptions;
///
/// let options = ConnectionOptions::from_json(r#"{ "operation_timeout_secs": 30 }"#)?;
/// assert_eq!(options.operation_timeout().as_secs(), 30);
/// # Ok::<(), eventhubs_amqp::AmqpError>(())
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Largest frame this side accepts; the connection uses the minimum of
    /// this and the peer's value.
    pub max_frame_size: u32,
    /// Upper bound for request-response operations (CBS, management).
    pub operation_timeout_secs: u64,
    /// Validity requested for each CBS token.
    pub token_validity_secs: u64,
    /// How often the token manager re-authorizes. Must be shorter than
    /// `token_validity_secs`.
    pub token_refresh_secs: u64,
    /// How long the event loop keeps draining queued work after it stops.
    pub drain_timeout_secs: u64,
    /// Initial credit granted on receive links.
    pub prefetch: u32,
    /// Maximum number of timer callbacks running at once.
    pub max_concurrent_timers: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT.as_secs(),
            token_validity_secs: DEFAULT_TOKEN_VALIDITY.as_secs(),
            token_refresh_secs: DEFAULT_TOKEN_REFRESH_INTERVAL.as_secs(),
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT.as_secs(),
            prefetch: DEFAULT_PREFETCH,
            max_concurrent_timers: DEFAULT_MAX_CONCURRENT_TIMERS,
        }
    }
}

impl ConnectionOptions {
    /// Parses options from JSON and validates them.
    pub fn from_json(json: &str) -> AmqpResult<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| AmqpError::InvalidArgument(format!("Invalid connection options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Builds options from `EVENTHUBS_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self, EnvVarError> {
        let mut options = Self::default();

        if let Some(value) = EnvUtils::get_parsed_var::<u32>(MAX_FRAME_SIZE_ENV)? {
            options.max_frame_size = value;
        }
        if let Some(value) = EnvUtils::get_duration_secs(OPERATION_TIMEOUT_ENV)? {
            options.operation_timeout_secs = value.as_secs();
        }
        if let Some(value) = EnvUtils::get_duration_secs(TOKEN_VALIDITY_ENV)? {
            options.token_validity_secs = value.as_secs();
        }
        if let Some(value) = EnvUtils::get_duration_secs(TOKEN_REFRESH_ENV)? {
            options.token_refresh_secs = value.as_secs();
        }
        if let Some(value) = EnvUtils::get_duration_secs(DRAIN_TIMEOUT_ENV)? {
            options.drain_timeout_secs = value.as_secs();
        }
        if let Some(value) = EnvUtils::get_parsed_var::<u32>(PREFETCH_ENV)? {
            options.prefetch = value;
        }

        log::debug!("Loaded connection options from environment: {options:?}");
        Ok(options)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> AmqpResult<()> {
        if self.max_frame_size < 512 {
            return Err(AmqpError::InvalidArgument(format!(
                "max_frame_size must be at least 512, got {}",
                self.max_frame_size
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(AmqpError::InvalidArgument(
                "operation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.token_refresh_secs == 0 || self.token_refresh_secs >= self.token_validity_secs {
            return Err(AmqpError::InvalidArgument(format!(
                "token_refresh_secs ({}) must be positive and shorter than token_validity_secs ({})",
                self.token_refresh_secs, self.token_validity_secs
            )));
        }
        if self.max_concurrent_timers == 0 {
            return Err(AmqpError::InvalidArgument(
                "max_concurrent_timers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_renewal_policy() {
        let options = ConnectionOptions::default();
        assert_eq!(options.token_validity(), Duration::from_secs(1200));
        assert_eq!(options.token_refresh_interval(), Duration::from_secs(300));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_from_json_keeps_defaults_for_missing_fields() {
        let options = ConnectionOptions::from_json(r#"{ "prefetch": 10 }"#).unwrap();
        assert_eq!(options.prefetch, 10);
        assert_eq!(options.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_refresh_must_be_shorter_than_validity() {
        let result =
            ConnectionOptions::from_json(r#"{ "token_validity_secs": 60, "token_refresh_secs": 60 }"#);
        assert!(matches!(result, Err(AmqpError::InvalidArgument(_))));
    }
}
