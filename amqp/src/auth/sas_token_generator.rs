use crate::common::{AmqpError, AmqpResult};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const SAS_PREFIX: &str = "SharedAccessSignature ";

/// Generator for Shared Access Signature (SAS) tokens.
///
/// Creates time-limited tokens by signing the URL-encoded audience and the
/// expiry instant with HMAC-SHA256, keyed by the UTF-8 bytes of the shared
/// access key. The generator holds no state; the key is passed per call so
/// that callers can keep it in a zeroizing container.
///
/// # Token Format
///
/// ```text
/// SharedAccessSignature sr=<audience>&sig=<signature>&se=<expiry>&skn=<key name>
/// ```
///
/// `sr`, `sig` and `skn` are URL-encoded; `se` is Unix seconds.
///
/// # Examples
///
/// ```no_run
/// use eventhubs_amqp::auth::SasTokenGenerator;
/// use std::time::Duration;
///
/// let token = SasTokenGenerator::generate(
///     "RootManageSharedAccessKey",
///     "shared-key",
///     "amqp://my-namespace.servicebus.windows.net/hub1",
///     Duration::from_secs(20 * 60),
/// )?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct SasTokenGenerator;

impl SasTokenGenerator {
    /// Generates a token that expires `time_to_live` from now.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidArgument`] if any input is empty or the
    /// time-to-live is zero, and [`AmqpError::CryptoError`] if the HMAC
    /// cannot be constructed.
    pub fn generate(
        key_name: &str,
        shared_key: &str,
        audience: &str,
        time_to_live: Duration,
    ) -> AmqpResult<String> {
        Self::generate_at(key_name, shared_key, audience, time_to_live, Utc::now())
    }

    /// Generates a token against an explicit clock reading.
    ///
    /// Deterministic: the same inputs always produce the same token.
    pub fn generate_at(
        key_name: &str,
        shared_key: &str,
        audience: &str,
        time_to_live: Duration,
        now: DateTime<Utc>,
    ) -> AmqpResult<String> {
        if key_name.trim().is_empty() {
            return Err(AmqpError::InvalidArgument(
                "Shared access key name cannot be empty".to_string(),
            ));
        }
        if shared_key.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "Shared access key cannot be empty".to_string(),
            ));
        }
        if audience.trim().is_empty() {
            return Err(AmqpError::InvalidArgument(
                "Token audience cannot be empty".to_string(),
            ));
        }
        if time_to_live.is_zero() {
            return Err(AmqpError::InvalidArgument(
                "Token time-to-live must be positive".to_string(),
            ));
        }

        let ttl_secs = i64::try_from(time_to_live.as_secs()).map_err(|_| {
            AmqpError::InvalidArgument(format!("Token time-to-live too large: {time_to_live:?}"))
        })?;
        // Sub-second lifetimes still expire at least one second out.
        let expires_on = now.timestamp() + ttl_secs.max(1);

        let encoded_audience = urlencoding::encode(audience);
        let string_to_sign = format!("{encoded_audience}\n{expires_on}");
        let signature = Self::sign(shared_key, &string_to_sign)?;

        Ok(format!(
            "{SAS_PREFIX}sr={}&sig={}&se={}&skn={}",
            encoded_audience,
            urlencoding::encode(&signature),
            expires_on,
            urlencoding::encode(key_name)
        ))
    }

    /// Base64 HMAC-SHA256 of `string_to_sign` keyed by the UTF-8 key bytes.
    pub fn sign(shared_key: &str, string_to_sign: &str) -> AmqpResult<String> {
        let mut mac = HmacSha256::new_from_slice(shared_key.as_bytes())
            .map_err(|e| AmqpError::CryptoError(format!("Failed to create HMAC-SHA256: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Extracts the `se` expiry of a SAS token.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidArgument`] if the token is not a SAS token
    /// or carries no valid `se` field.
    pub fn parse_expiry(token: &str) -> AmqpResult<DateTime<Utc>> {
        let fields = token.strip_prefix(SAS_PREFIX).ok_or_else(|| {
            AmqpError::InvalidArgument("Token is not a SharedAccessSignature".to_string())
        })?;

        let seconds = fields
            .split('&')
            .find_map(|pair| pair.strip_prefix("se="))
            .ok_or_else(|| AmqpError::InvalidArgument("SAS token has no 'se' field".to_string()))?
            .parse::<i64>()
            .map_err(|e| AmqpError::InvalidArgument(format!("Invalid SAS expiry: {e}")))?;

        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| AmqpError::InvalidArgument(format!("SAS expiry out of range: {seconds}")))
    }
}
