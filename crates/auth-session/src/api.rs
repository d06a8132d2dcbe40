//! Wire types for the Versecraft auth API.
//!
//! All bodies are JSON with camelCase keys, matching the server contract.

use serde::{Deserialize, Serialize};

/// Endpoint paths under the API base URL.
pub mod endpoints {
    pub const REGISTER: &str = "/auth/register";
    pub const LOGIN: &str = "/auth/login";
    pub const REFRESH: &str = "/auth/refresh";
    pub const ME: &str = "/auth/me";
    pub const LOGOUT: &str = "/auth/logout";
    pub const ANONYMOUS: &str = "/auth/anonymous";
    pub const GOOGLE: &str = "/auth/google";
}

/// User record as returned by the auth server.
///
/// Replaced wholesale on every successful auth operation, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_anonymous_account: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Response shape shared by register/login/anonymous/google.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds, when the server includes it.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Response shape of `/auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    /// Present when the server rotates refresh tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Response envelope of `/auth/me`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEnvelope {
    pub user: User,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub username: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleSignInRequest<'a> {
    pub id_token: &'a str,
}

/// Convert an `expiresIn` hint into an absolute RFC 3339 expiry timestamp.
pub fn expires_at_from(expires_in: Option<i64>) -> Option<String> {
    expires_in.map(|secs| (chrono::Utc::now() + chrono::Duration::seconds(secs)).to_rfc3339())
}
