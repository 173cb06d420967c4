//! Credential collaborator consulted at the start of every sync session.

use async_trait::async_trait;
use thiserror::Error;

use crate::sync::AccessToken;
use crate::util::normalize_text_option;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("not signed in")]
    MissingCredential,
    #[error("credential expired")]
    Expired,
    #[error("credential provider failed: {0}")]
    Provider(String),
}

/// Supplies a currently valid credential for gateway calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<AccessToken, AuthError>;
}

/// A fixed, configured token.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    token: Option<AccessToken>,
}

impl StaticCredentialProvider {
    /// Blank tokens count as missing.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: normalize_text_option(Some(token.into())).map(AccessToken::new),
        }
    }

    /// Provider that always reports a missing credential.
    pub const fn signed_out() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credential(&self) -> Result<AccessToken, AuthError> {
        self.token.clone().ok_or(AuthError::MissingCredential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_static_provider() {
        let provider = StaticCredentialProvider::new(" token ");
        assert_eq!(provider.credential().await.unwrap().secret(), "token");

        assert_eq!(
            StaticCredentialProvider::new("   ").credential().await,
            Err(AuthError::MissingCredential)
        );
        assert_eq!(
            StaticCredentialProvider::signed_out().credential().await,
            Err(AuthError::MissingCredential)
        );
    }
}
