//! Environment variable access for connection configuration.
//!
//! Values are trimmed and must be non-empty. Numeric settings are parsed
//! eagerly so that a typo in `EVENTHUBS_OPERATION_TIMEOUT_SECS` fails at
//! startup instead of silently falling back to a default.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when reading configuration from the environment.
#[derive(Debug, Error)]
pub enum EnvVarError {
    /// Environment variable is not set
    #[error("Environment variable '{name}' not found. Please set it in your environment.")]
    NotFound { name: String },

    /// Environment variable contains invalid UTF-8 characters
    #[error("Environment variable '{name}' contains invalid UTF-8 characters.")]
    InvalidUtf8 { name: String },

    /// Environment variable is set but contains only whitespace or is empty
    #[error("Environment variable '{name}' is empty. Please provide a valid value.")]
    Empty { name: String },

    /// Environment variable could not be parsed into the expected type
    #[error("Environment variable '{name}' has invalid value '{value}': {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Validated access to environment variables.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::utils::EnvUtils;
///
/// let connection_string = EnvUtils::get_validated_var("EVENTHUBS_CONNECTION_STRING")?;
/// let timeout = EnvUtils::get_duration_secs("EVENTHUBS_OPERATION_TIMEOUT_SECS")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EnvUtils;

impl EnvUtils {
    /// Gets an environment variable, trimmed and required to be non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`EnvVarError`] if:
    /// - The variable is not set ([`EnvVarError::NotFound`])
    /// - The variable is empty or contains only whitespace ([`EnvVarError::Empty`])
    /// - The variable contains invalid UTF-8 ([`EnvVarError::InvalidUtf8`])
    pub fn get_validated_var(name: &str) -> Result<String, EnvVarError> {
        match std::env::var(name) {
            Ok(value) => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    Err(EnvVarError::Empty {
                        name: name.to_string(),
                    })
                } else {
                    Ok(trimmed.to_string())
                }
            }
            Err(std::env::VarError::NotPresent) => Err(EnvVarError::NotFound {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(EnvVarError::InvalidUtf8 {
                name: name.to_string(),
            }),
        }
    }

    /// Parses an optional variable. Missing or empty yields `Ok(None)`,
    /// a present value that fails to parse yields [`EnvVarError::Invalid`].
    pub fn get_parsed_var<T>(name: &str) -> Result<Option<T>, EnvVarError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_validated_var(name) {
            Ok(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| EnvVarError::Invalid {
                    name: name.to_string(),
                    value,
                    reason: e.to_string(),
                }),
            Err(EnvVarError::NotFound { .. }) | Err(EnvVarError::Empty { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads a whole number of seconds as a [`Duration`].
    pub fn get_duration_secs(name: &str) -> Result<Option<Duration>, EnvVarError> {
        Ok(Self::get_parsed_var::<u64>(name)?.map(Duration::from_secs))
    }
}
