//! Single-flight token refresh.
//!
//! Any number of tasks can ask for a refresh at the same moment (the
//! scheduler firing, several requests hitting 401 together); exactly one
//! HTTP call to the refresh endpoint goes out and every waiter observes the
//! same outcome.

use crate::api::{self, endpoints, RefreshRequest, RefreshResponse};
use crate::error::{AuthError, AuthResult};
use crate::retry::RetryPolicy;
use credential_vault::TokenStore;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Result of a completed refresh, fanned out to all waiters.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub expires_in: Option<i64>,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<RefreshOutcome, Arc<AuthError>>>>;

/// Callback fired once when a refresh fails terminally and the session is
/// torn down.
pub type SessionLostHandler = Arc<dyn Fn() + Send + Sync>;

/// Coordinates refresh calls so at most one is in flight.
pub struct RefreshGate {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    policy: RetryPolicy,
    inflight: Mutex<Option<SharedRefresh>>,
    on_session_lost: Mutex<Option<SessionLostHandler>>,
}

impl RefreshGate {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        tokens: Arc<TokenStore>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            base_url,
            tokens,
            policy,
            inflight: Mutex::new(None),
            on_session_lost: Mutex::new(None),
        })
    }

    /// Install the handler invoked when the refresh token is rejected and the
    /// session cannot be recovered.
    pub fn set_session_lost_handler(&self, handler: SessionLostHandler) {
        *self
            .on_session_lost
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    /// Refresh the access token, joining an in-flight refresh if one exists.
    pub async fn refresh(self: &Arc<Self>) -> AuthResult<RefreshOutcome> {
        let (shared, created) = {
            let mut slot = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.as_ref() {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fut = Self::perform(Arc::clone(self)).boxed().shared();
                    *slot = Some(fut.clone());
                    (fut, true)
                }
            }
        };

        if !created {
            debug!("joining in-flight refresh");
        }

        let result = shared.clone().await;

        // First waiter back clears the slot; ptr_eq keeps us from evicting a
        // newer refresh that started after this one settled.
        {
            let mut slot = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&shared)) {
                *slot = None;
            }
        }

        result.map_err(|err| err.duplicate())
    }

    /// The refresh itself. Runs exactly once per shared future, so the
    /// terminal-failure teardown cannot fire more than once per refresh.
    async fn perform(gate: Arc<RefreshGate>) -> Result<RefreshOutcome, Arc<AuthError>> {
        let Some(refresh_token) = gate.tokens.refresh_token() else {
            debug!("no refresh token stored");
            return Err(Arc::new(AuthError::RefreshExhausted));
        };

        let result = gate
            .policy
            .run("token_refresh", |_attempt| {
                let gate = Arc::clone(&gate);
                let refresh_token = refresh_token.clone();
                async move { gate.refresh_once(&refresh_token).await }
            })
            .await;

        match result {
            Ok(response) => {
                let rotated = response
                    .refresh_token
                    .clone()
                    .unwrap_or_else(|| refresh_token.clone());
                gate.tokens.set_pair(&response.access_token, &rotated);
                if let Some(mut meta) = gate.tokens.meta() {
                    meta.expires_at = api::expires_at_from(response.expires_in);
                    gate.tokens.set_meta(meta);
                }
                info!(
                    rotated = response.refresh_token.is_some(),
                    "access token refreshed"
                );
                Ok(RefreshOutcome {
                    access_token: response.access_token,
                    expires_in: response.expires_in,
                })
            }
            Err(err) if !err.is_transient() => {
                warn!(error = %err, "refresh token rejected, tearing down session");
                gate.tokens.clear();
                let handler = gate
                    .on_session_lost
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                if let Some(handler) = handler {
                    handler();
                }
                Err(Arc::new(AuthError::RefreshExhausted))
            }
            Err(err) => {
                warn!(error = %err, "refresh failed, will retry later");
                Err(Arc::new(err))
            }
        }
    }

    async fn refresh_once(&self, refresh_token: &str) -> AuthResult<RefreshResponse> {
        let url = format!("{}{}", self.base_url, endpoints::REFRESH);
        let response = self
            .http
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::from_status(status.as_u16(), body));
        }

        Ok(response.json::<RefreshResponse>().await?)
    }
}

impl std::fmt::Debug for RefreshGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshGate")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
