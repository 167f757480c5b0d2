//! Credential provider seam.
//!
//! Authenticated endpoints get a bearer token on every request from a
//! [`CredentialProvider`]. The hub never caches tokens, so short-lived
//! credentials rotate without a restart.

use async_trait::async_trait;

use crate::upstream::{EndpointConfig, UpstreamError};

/// Supplies short-lived tokens for authenticated endpoints.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Token for `endpoint`, or `None` if it needs no authentication.
    async fn token(&self, endpoint: &EndpointConfig) -> Result<Option<String>, UpstreamError>;
}

/// Reads the token from the environment variable named by the endpoint's
/// `auth_token_env`, at call time.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn token(&self, endpoint: &EndpointConfig) -> Result<Option<String>, UpstreamError> {
        let Some(var) = endpoint.auth_token_env.as_deref() else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
            _ => Err(UpstreamError::unavailable(
                &endpoint.name,
                format!("credential variable '{var}' is not set"),
            )),
        }
    }
}
