//! Storage key constants.

/// Storage keys used by the client
pub struct StorageKeys;

impl StorageKeys {
    /// Access token
    pub const ACCESS_TOKEN: &'static str = "access_token";

    /// Refresh token
    pub const REFRESH_TOKEN: &'static str = "refresh_token";

    /// Session metadata (JSON)
    pub const SESSION_META: &'static str = "session_meta";
}
