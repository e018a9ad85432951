//! Authentication and Authorization
//!
//! Provides:
//! - API key authentication for the connect handshake
//! - Scope-based authorization
//! - Key generation, registration of pre-hashed keys, revocation
//! - Constant-time hash comparison

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of generated API keys
pub const KEY_PREFIX: &str = "coderun_";

/// Authentication/Authorization errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credentials provided
    #[error("Authentication required")]
    MissingCredentials,

    /// Invalid token or API key
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Token has been revoked
    #[error("Token revoked")]
    TokenRevoked,

    /// Insufficient permissions
    #[error("Insufficient scope: requires {required}")]
    InsufficientScope {
        /// The scope that was required
        required: String,
    },

    /// Internal error
    #[error("Auth internal error: {0}")]
    Internal(String),
}

/// Auth result type
pub type Result<T> = std::result::Result<T, AuthError>;

/// Authorization scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Full access, including other users' sessions
    Admin,
    /// Submit source code and drive a run
    RunExecute,
    /// Read session status and transcripts
    SessionRead,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Admin => write!(f, "admin"),
            Scope::RunExecute => write!(f, "run_execute"),
            Scope::SessionRead => write!(f, "session_read"),
        }
    }
}

/// How the requester authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// API key presented in the connect frame or a header
    ApiKey,
    /// Auth disabled
    Anonymous,
}

/// Authenticated context attached to each request
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// User identifier
    pub user_id: String,
    /// How the user authenticated
    pub method: AuthMethod,
    /// Granted scopes
    pub scopes: Vec<Scope>,
}

impl AuthContext {
    /// Context for a user with the default scopes
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            method: AuthMethod::ApiKey,
            scopes: default_user_scopes(),
        }
    }

    /// Check if this context has a specific scope
    pub fn has_scope(&self, scope: &Scope) -> bool {
        self.scopes.contains(&Scope::Admin) || self.scopes.contains(scope)
    }

    /// Require a specific scope, returning error if missing
    pub fn require_scope(&self, scope: &Scope) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::InsufficientScope {
                required: scope.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone)]
struct StoredKey {
    /// SHA-256 of the key; the raw key is never stored
    key_hash: [u8; 32],
    user_id: String,
    scopes: Vec<Scope>,
    label: String,
    created_at: DateTime<Utc>,
    revoked: bool,
}

/// API key storage and validation
pub struct AuthStore {
    /// key_hash_hex → StoredKey
    keys: RwLock<HashMap<String, StoredKey>>,
    enabled: bool,
}

impl AuthStore {
    /// Create a new auth store
    pub fn new(enabled: bool) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            enabled,
        }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn hash_key(key: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.finalize().into()
    }

    fn hash_to_hex(hash: &[u8; 32]) -> String {
        hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn hex_to_hash(hex: &str) -> Option<[u8; 32]> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(out)
    }

    /// Generate a fresh key without storing it: `(raw_key, hash_hex)`
    pub fn mint_key() -> (SecretString, String) {
        let raw_key = format!("{KEY_PREFIX}{}", Uuid::new_v4().as_simple());
        let hash_hex = Self::hash_to_hex(&Self::hash_key(&raw_key));
        (SecretString::from(raw_key), hash_hex)
    }

    /// Generate and store a new API key for a user
    ///
    /// Returns the raw key (only shown once) and the key hash for reference.
    pub fn generate_api_key(
        &self,
        user_id: &str,
        scopes: Vec<Scope>,
        label: &str,
    ) -> Result<(SecretString, String)> {
        let (raw_key, key_hash_hex) = Self::mint_key();
        self.register_key_hash(&key_hash_hex, user_id, scopes, label)?;
        info!(user_id = %user_id, label = %label, "API key generated");
        Ok((raw_key, key_hash_hex))
    }

    /// Register a key by its SHA-256 hex digest (static configuration)
    pub fn register_key_hash(
        &self,
        key_hash_hex: &str,
        user_id: &str,
        scopes: Vec<Scope>,
        label: &str,
    ) -> Result<()> {
        let normalized = key_hash_hex.to_ascii_lowercase();
        let key_hash = Self::hex_to_hash(&normalized).ok_or_else(|| {
            AuthError::Internal(format!("invalid key hash for '{label}'"))
        })?;

        let stored = StoredKey {
            key_hash,
            user_id: user_id.to_string(),
            scopes,
            label: label.to_string(),
            created_at: Utc::now(),
            revoked: false,
        };

        let mut keys = self
            .keys
            .write()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;
        keys.insert(normalized, stored);
        debug!(user_id = %user_id, label = %label, "API key registered");
        Ok(())
    }

    /// Validate a token/API key and return the auth context
    pub fn validate_token(&self, token: &str) -> Result<AuthContext> {
        if !self.enabled {
            return Ok(AuthContext {
                user_id: "anonymous".to_string(),
                method: AuthMethod::Anonymous,
                scopes: vec![Scope::Admin],
            });
        }

        if token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let token_hash = Self::hash_key(token);
        let token_hash_hex = Self::hash_to_hex(&token_hash);

        let keys = self
            .keys
            .read()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;

        let Some(stored) = keys.get(&token_hash_hex) else {
            warn!("Invalid token attempt");
            return Err(AuthError::InvalidCredentials);
        };

        let hashes_match: bool = stored.key_hash.ct_eq(&token_hash).into();
        if !hashes_match {
            return Err(AuthError::InvalidCredentials);
        }
        if stored.revoked {
            return Err(AuthError::TokenRevoked);
        }

        debug!(user_id = %stored.user_id, label = %stored.label, "Token validated");
        Ok(AuthContext {
            user_id: stored.user_id.clone(),
            method: AuthMethod::ApiKey,
            scopes: stored.scopes.clone(),
        })
    }

    /// Revoke a key by its hash
    pub fn revoke_key(&self, key_hash_hex: &str) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;

        match keys.get_mut(key_hash_hex) {
            Some(stored) => {
                stored.revoked = true;
                info!(user_id = %stored.user_id, label = %stored.label, "API key revoked");
                Ok(())
            }
            None => Err(AuthError::InvalidCredentials),
        }
    }

    /// List all keys (non-sensitive info only)
    pub fn list_keys(&self) -> Result<Vec<ApiKeyInfo>> {
        let keys = self
            .keys
            .read()
            .map_err(|e| AuthError::Internal(format!("Lock poisoned: {}", e)))?;

        Ok(keys
            .iter()
            .map(|(hash_hex, stored)| ApiKeyInfo {
                key_hash: hash_hex.clone(),
                user_id: stored.user_id.clone(),
                label: stored.label.clone(),
                scopes: stored.scopes.clone(),
                created_at: stored.created_at,
                revoked: stored.revoked,
            })
            .collect())
    }

    /// Count of non-revoked keys
    pub fn active_key_count(&self) -> usize {
        self.keys
            .read()
            .map(|keys| keys.values().filter(|k| !k.revoked).count())
            .unwrap_or(0)
    }
}

/// Non-sensitive API key information for listing
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    /// Hash of the key (for identification/revocation)
    pub key_hash: String,
    /// Owner user ID
    pub user_id: String,
    /// Human-readable label
    pub label: String,
    /// Granted scopes
    pub scopes: Vec<Scope>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Whether revoked
    pub revoked: bool,
}

/// Scopes for an ordinary client key
pub fn default_user_scopes() -> Vec<Scope> {
    vec![Scope::RunExecute, Scope::SessionRead]
}

/// Admin scopes
pub fn admin_scopes() -> Vec<Scope> {
    vec![Scope::Admin]
}
