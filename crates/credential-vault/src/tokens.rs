//! High-level token storage.

use crate::{KvStore, StorageKeys, StorageResult};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Seconds of remaining lifetime below which a token counts as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// The current access/refresh token pair.
///
/// A refresh token without an access token is a valid state (mid-refresh).
/// Neither field is ever an empty string; absent means removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

impl TokenPair {
    /// True if either token is present.
    pub fn has_any(&self) -> bool {
        self.access.is_some() || self.refresh.is_some()
    }
}

/// Session metadata persisted alongside the tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMeta {
    /// User ID from the auth server
    pub user_id: String,
    /// User email
    #[serde(default)]
    pub email: Option<String>,
    /// Display username
    pub username: String,
    /// Whether this is an anonymous visitor account
    #[serde(default)]
    pub is_anonymous: bool,
    /// Account creation time (ISO timestamp)
    #[serde(default)]
    pub created_at: Option<String>,
    /// When the access token expires (ISO timestamp), if the server told us
    #[serde(default)]
    pub expires_at: Option<String>,
}

struct VaultState {
    pair: TokenPair,
    meta: Option<SessionMeta>,
}

/// Token store: in-memory authoritative token pair backed by durable storage.
///
/// Every mutation persists synchronously so a restart does not lose session
/// state. Persistence failures are logged and swallowed; the in-memory value
/// stays authoritative for the current process lifetime. Writers replace the
/// pair under one lock, so readers never observe a partial update.
pub struct TokenStore {
    store: Box<dyn KvStore>,
    state: Mutex<VaultState>,
}

impl TokenStore {
    /// Create a token store, loading any persisted session into memory.
    pub fn new(store: Box<dyn KvStore>) -> Self {
        let access = store.get(StorageKeys::ACCESS_TOKEN).unwrap_or_default();
        let refresh = store.get(StorageKeys::REFRESH_TOKEN).unwrap_or_default();
        let meta = store
            .get(StorageKeys::SESSION_META)
            .ok()
            .flatten()
            .and_then(|json| serde_json::from_str(&json).ok());

        if access.is_some() || refresh.is_some() {
            debug!("Restored persisted token pair");
        }

        Self {
            store,
            state: Mutex::new(VaultState {
                pair: TokenPair { access, refresh },
                meta,
            }),
        }
    }

    /// Current access token.
    pub fn access(&self) -> Option<String> {
        self.state.lock().unwrap().pair.access.clone()
    }

    /// Current refresh token.
    pub fn refresh_token(&self) -> Option<String> {
        self.state.lock().unwrap().pair.refresh.clone()
    }

    /// Current token pair.
    pub fn pair(&self) -> TokenPair {
        self.state.lock().unwrap().pair.clone()
    }

    /// True if any token is held.
    pub fn has_any(&self) -> bool {
        self.state.lock().unwrap().pair.has_any()
    }

    /// Session metadata, if a session exists.
    pub fn meta(&self) -> Option<SessionMeta> {
        self.state.lock().unwrap().meta.clone()
    }

    /// Replace the access token, leaving the refresh token unchanged.
    pub fn set_access(&self, token: &str) {
        if token.is_empty() {
            warn!("Rejected empty access token");
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.pair.access = Some(token.to_string());
        self.persist(StorageKeys::ACCESS_TOKEN, Some(token));
    }

    /// Replace both tokens atomically.
    pub fn set_pair(&self, access: &str, refresh: &str) {
        if access.is_empty() || refresh.is_empty() {
            warn!("Rejected empty token in pair update");
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.pair.access = Some(access.to_string());
        state.pair.refresh = Some(refresh.to_string());
        self.persist(StorageKeys::ACCESS_TOKEN, Some(access));
        self.persist(StorageKeys::REFRESH_TOKEN, Some(refresh));
    }

    /// Replace session metadata.
    pub fn set_meta(&self, meta: SessionMeta) {
        let json = match serde_json::to_string(&meta) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode session metadata");
                return;
            }
        };
        let mut state = self.state.lock().unwrap();
        state.meta = Some(meta);
        self.persist(StorageKeys::SESSION_META, Some(&json));
    }

    /// Store a complete session (both tokens + metadata) atomically.
    pub fn set_session(&self, access: &str, refresh: &str, meta: SessionMeta) {
        if access.is_empty() || refresh.is_empty() {
            warn!("Rejected empty token in session update");
            return;
        }
        let json = serde_json::to_string(&meta).ok();
        let mut state = self.state.lock().unwrap();
        state.pair.access = Some(access.to_string());
        state.pair.refresh = Some(refresh.to_string());
        state.meta = Some(meta);
        self.persist(StorageKeys::ACCESS_TOKEN, Some(access));
        self.persist(StorageKeys::REFRESH_TOKEN, Some(refresh));
        self.persist(StorageKeys::SESSION_META, json.as_deref());
    }

    /// Remove all tokens and metadata, in memory and on disk.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.pair = TokenPair::default();
        state.meta = None;
        self.persist(StorageKeys::ACCESS_TOKEN, None);
        self.persist(StorageKeys::REFRESH_TOKEN, None);
        self.persist(StorageKeys::SESSION_META, None);
    }

    /// True if the access token is known to be expired (or expiring within
    /// the skew margin). An unknown expiry counts as live; the 401 path
    /// catches genuinely dead tokens.
    pub fn is_expired(&self) -> bool {
        let state = self.state.lock().unwrap();
        let Some(meta) = state.meta.as_ref() else {
            return false;
        };
        let Some(expires_at) = meta.expires_at.as_deref() else {
            return false;
        };
        match chrono::DateTime::parse_from_rfc3339(expires_at) {
            Ok(expires_at) => {
                let remaining = expires_at.signed_duration_since(chrono::Utc::now());
                remaining.num_seconds() < EXPIRY_SKEW_SECS
            }
            Err(_) => true,
        }
    }

    fn persist(&self, key: &str, value: Option<&str>) {
        let result: StorageResult<()> = match value {
            Some(value) => self.store.set(key, value),
            None => self.store.delete(key).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(key = %key, error = %e, "Token persistence failed, keeping in-memory value");
        }
    }
}
