//! Identity and the credential seam.
//!
//! Session issuance lives outside this crate. The server only needs to
//! turn the token presented at upgrade time into an [`Identity`], and to
//! ask whether an identity may kick other users.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AuthConfig, TokenEntry};

/// Authenticated user as handed over by the credential collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing session token")]
    MissingToken,
    #[error("invalid or expired session token")]
    InvalidToken,
}

/// External credential collaborator.
pub trait Authenticator: Send + Sync {
    /// Resolve a session token to an identity.
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;

    /// Whether `identity` may use administrative operations (`kick_user`).
    fn is_administrator(&self, identity: &Identity) -> bool;
}

/// Fixed token table, loaded from the `[auth]` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
    admin: String,
}

impl StaticTokens {
    pub fn new(admin: impl Into<String>) -> Self {
        Self {
            tokens: HashMap::new(),
            admin: admin.into(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let mut table = Self::new(config.admin.clone());
        for TokenEntry {
            token,
            username,
            display_name,
        } in &config.tokens
        {
            table.insert(token.clone(), Identity::new(username.clone(), display_name.clone()));
        }
        table
    }

    /// Register (or replace) a token.
    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }

    fn is_administrator(&self, identity: &Identity) -> bool {
        identity.username == self.admin
    }
}
