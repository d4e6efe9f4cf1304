//! Credentials, SAS tokens and CBS token renewal.

pub mod connection_string;
pub mod provider;
pub mod sas_token_generator;
pub mod shared_access_key;
pub mod token_cache;
pub mod token_manager;

pub use connection_string::{ConnectionStringProperties, SharedAccessKey};
pub use provider::{AccessToken, TokenProvider, TokenType};
pub use sas_token_generator::SasTokenGenerator;
pub use shared_access_key::SharedAccessKeyCredential;
pub use token_cache::TokenCache;
pub use token_manager::{AuthorizationOutcome, ClaimsAuthorizer, TokenManager};
