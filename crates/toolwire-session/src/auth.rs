//! Built-in credential verifiers.

use std::collections::HashMap;

use async_trait::async_trait;
use toolwire_core::{AuthError, AuthVerifier, Identity};

/// Verifier that accepts every caller, with or without a credential.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

#[async_trait]
impl AuthVerifier for AllowAll {
    async fn verify(&self, _credential: Option<&str>) -> Result<Identity, AuthError> {
        Ok(Identity::new("anonymous"))
    }
}

/// Verifier backed by a fixed token table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let token = credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Missing)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Rejected("unknown token".to_string()))
    }
}
