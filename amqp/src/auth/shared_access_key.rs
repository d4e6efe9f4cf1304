use super::connection_string::{ConnectionStringProperties, SharedAccessKey};
use super::provider::{AccessToken, TokenProvider, TokenType};
use super::sas_token_generator::SasTokenGenerator;
use super::token_cache::TokenCache;
use crate::common::AmqpResult;
use async_trait::async_trait;
use std::time::Duration;

/// Token provider that signs SAS tokens with a shared access key.
///
/// Tokens are cached per audience and reused until they come within the
/// cache's refresh buffer of expiring.
#[derive(Clone)]
pub struct SharedAccessKeyCredential {
    key_name: String,
    key: SharedAccessKey,
    cache: TokenCache,
}

impl SharedAccessKeyCredential {
    pub fn new(key_name: impl Into<String>, key: SharedAccessKey) -> Self {
        Self {
            key_name: key_name.into(),
            key,
            cache: TokenCache::new(),
        }
    }

    pub fn from_connection_string(properties: &ConnectionStringProperties) -> Self {
        Self::new(
            properties.shared_access_key_name(),
            properties.shared_access_key().clone(),
        )
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }
}

#[async_trait]
impl TokenProvider for SharedAccessKeyCredential {
    async fn get_token(&self, audience: &str, validity: Duration) -> AmqpResult<AccessToken> {
        if let Some(cached) = self.cache.get(audience).await {
            log::debug!("Using cached SAS token for '{audience}'");
            return Ok(cached);
        }

        let token =
            SasTokenGenerator::generate(&self.key_name, self.key.expose(), audience, validity)?;
        let expires_on = SasTokenGenerator::parse_expiry(&token)?;

        let access_token = AccessToken {
            token,
            token_type: TokenType::SharedAccessSignature,
            expires_on,
        };
        self.cache
            .set(audience.to_string(), access_token.clone())
            .await;
        log::debug!("Generated SAS token for '{audience}' expiring at {expires_on}");

        Ok(access_token)
    }
}
