//! Session controller.
//!
//! Owns the auth state machine and wires the token store, refresh gate,
//! scheduler, gateway, and offline queue into the operations an application
//! actually calls: sign-up, sign-in (password, anonymous, Google), sign-out,
//! current-user, and session restore.

use crate::api::{
    self, endpoints, AuthResponse, GoogleSignInRequest, LoginRequest, RegisterRequest, User,
    UserEnvelope,
};
use crate::auth_fsm::{AuthMachine, AuthMachineInput, AuthState};
use crate::config::Config;
use crate::error::{AuthError, AuthResult};
use crate::gateway::HttpGateway;
use crate::offline_queue::{OfflineQueue, DEFAULT_QUEUE_CAPACITY};
use crate::refresh::RefreshGate;
use crate::retry::RetryPolicy;
use crate::scheduler::RefreshScheduler;
use connectivity_monitor::NetworkMonitor;
use credential_vault::{FileStore, KvStore, SessionMeta, TokenStore};
use futures_util::FutureExt;
use reqwest::Method;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time view of the session, handed to state listeners.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AuthSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }
}

/// Callback invoked on every state change.
pub type StateListener = Box<dyn Fn(AuthSnapshot) + Send + Sync>;

pub struct AuthController {
    tokens: Arc<TokenStore>,
    gate: Arc<RefreshGate>,
    scheduler: Arc<RefreshScheduler>,
    gateway: Arc<HttpGateway>,
    queue: Arc<OfflineQueue>,
    monitor: Arc<dyn NetworkMonitor>,
    machine: Mutex<AuthMachine>,
    user: Mutex<Option<User>>,
    last_error: Mutex<Option<String>>,
    listener: Mutex<Option<StateListener>>,
    replay_worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuthController {
    /// Assemble a controller over the given credential store and
    /// connectivity monitor.
    pub fn new(
        config: &Config,
        store: Box<dyn KvStore>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> AuthResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let base_url = url::Url::parse(&config.api_url)?;
        let base_url = base_url.as_str().trim_end_matches('/').to_string();
        let policy = RetryPolicy::from_config(config);

        let tokens = Arc::new(TokenStore::new(store));
        let gate = RefreshGate::new(
            http.clone(),
            base_url.clone(),
            Arc::clone(&tokens),
            policy.clone(),
        );
        let queue = OfflineQueue::new(DEFAULT_QUEUE_CAPACITY);
        let gateway = HttpGateway::new(
            http,
            base_url,
            Arc::clone(&tokens),
            Arc::clone(&gate),
            Arc::clone(&queue),
            Arc::clone(&monitor),
            policy,
        );

        let scheduler_gate = Arc::clone(&gate);
        let scheduler = RefreshScheduler::new(Arc::new(move || {
            let gate = Arc::clone(&scheduler_gate);
            async move { gate.refresh().await.map(|outcome| outcome.expires_in) }.boxed()
        }));

        let controller = Arc::new(Self {
            tokens,
            gate,
            scheduler,
            gateway,
            queue: Arc::clone(&queue),
            monitor: Arc::clone(&monitor),
            machine: Mutex::new(AuthMachine::new()),
            user: Mutex::new(None),
            last_error: Mutex::new(None),
            listener: Mutex::new(None),
            replay_worker: Mutex::new(None),
        });

        // Terminal refresh failure anywhere (scheduler, 401 path, manual)
        // tears the session down exactly once; reflect that in our state.
        let weak = Arc::downgrade(&controller);
        controller
            .gate
            .set_session_lost_handler(Arc::new(move || {
                if let Some(controller) = weak.upgrade() {
                    info!("session revoked, dropping to anonymous");
                    controller.scheduler.cancel();
                    controller.force_anonymous(
                        AuthMachineInput::SessionRevoked,
                        Some("session expired".to_string()),
                    );
                }
            }));

        let worker = queue.start(monitor.as_ref());
        *lock(&controller.replay_worker) = Some(worker);

        Ok(controller)
    }

    /// Controller backed by the default on-disk vault and an
    /// initially-online connectivity monitor.
    pub fn bootstrap(config: &Config) -> AuthResult<Arc<Self>> {
        let store = FileStore::open_default()?;
        let monitor = connectivity_monitor::ConnectivityMonitor::new(true);
        Self::new(config, Box::new(store), monitor)
    }

    /// Register the listener notified on every state change. Replaces any
    /// previous listener.
    pub fn on_state_change(&self, listener: StateListener) {
        *lock(&self.listener) = Some(listener);
    }

    pub fn state(&self) -> AuthState {
        AuthState::from(lock(&self.machine).state())
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            state: self.state(),
            user: lock(&self.user).clone(),
            last_error: lock(&self.last_error).clone(),
        }
    }

    /// Gateway for application traffic beyond the auth endpoints.
    pub fn gateway(&self) -> &Arc<HttpGateway> {
        &self.gateway
    }

    /// Abandon one in-flight request by id.
    pub fn cancel_request(&self, id: &Uuid) -> bool {
        self.gateway.cancel(id)
    }

    /// Abandon all in-flight requests.
    pub fn cancel_all_requests(&self) -> usize {
        self.gateway.cancel_all()
    }

    /// Restore a persisted session at startup.
    ///
    /// With no stored tokens this is a no-op. With stored tokens the session
    /// is adopted optimistically; an already-expired access token is
    /// refreshed before the session is considered live.
    pub async fn restore_session(&self) -> AuthResult<AuthSnapshot> {
        if !self.tokens.has_any() {
            debug!("no persisted session");
            return Ok(self.snapshot());
        }

        self.transition(AuthMachineInput::AttemptStarted)?;

        let meta = self.tokens.meta();
        if let Some(meta) = &meta {
            *lock(&self.user) = Some(user_from_meta(meta));
        }

        if self.tokens.is_expired() && self.monitor.is_online() {
            match self.gate.refresh().await {
                Ok(outcome) => {
                    self.transition(AuthMachineInput::AttemptSucceeded)?;
                    self.scheduler.schedule(outcome.expires_in);
                }
                Err(err) if err.is_transient() => {
                    // Keep the session; the scheduler will keep trying
                    warn!(error = %err, "could not refresh restored session yet");
                    self.transition(AuthMachineInput::AttemptSucceeded)?;
                    self.scheduler.schedule(Some(0));
                }
                Err(err) => {
                    debug!(error = %err, "persisted session no longer valid");
                    self.force_anonymous(AuthMachineInput::SignedOut, None);
                    return Ok(self.snapshot());
                }
            }
        } else {
            self.transition(AuthMachineInput::AttemptSucceeded)?;
            let remaining = meta.as_ref().and_then(remaining_lifetime_secs);
            self.scheduler.schedule(remaining);
        }

        info!("session restored");
        Ok(self.snapshot())
    }

    /// Create a new account and sign in as it.
    pub async fn sign_up(&self, email: &str, username: &str, password: &str) -> AuthResult<User> {
        let body = serde_json::to_value(RegisterRequest {
            email,
            password,
            username,
        })?;
        self.credentialed_attempt(endpoints::REGISTER, Some(body))
            .await
    }

    /// Sign in with email and password. While offline the attempt is
    /// deferred and resolves after reconnect.
    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<User> {
        let body = serde_json::to_value(LoginRequest { email, password })?;
        self.credentialed_attempt(endpoints::LOGIN, Some(body)).await
    }

    /// Create an anonymous account. The server mints credentials for it and
    /// they are stored like any other session.
    pub async fn sign_in_anonymous(&self) -> AuthResult<User> {
        self.credentialed_attempt(endpoints::ANONYMOUS, None).await
    }

    /// Sign in with a Google ID token.
    pub async fn sign_in_with_google(&self, id_token: &str) -> AuthResult<User> {
        let body = serde_json::to_value(GoogleSignInRequest { id_token })?;
        self.credentialed_attempt(endpoints::GOOGLE, Some(body)).await
    }

    /// Sign out unconditionally.
    ///
    /// Local state is always cleared, even when the server cannot be
    /// reached: in-flight requests are cancelled, deferred requests dropped,
    /// the refresh timer disarmed, and the vault wiped. The server-side
    /// logout is best effort.
    pub async fn sign_out(&self) -> AuthResult<()> {
        self.cancel_all_requests();
        self.scheduler.cancel();
        self.queue.clear().await;

        if self.monitor.is_online() && self.tokens.access().is_some() {
            if let Err(err) = self
                .gateway
                .send(Method::POST, endpoints::LOGOUT, None)
                .await
            {
                warn!(error = %err, "server logout failed, clearing local session anyway");
            }
        }

        self.tokens.clear();
        self.force_anonymous(AuthMachineInput::SignedOut, None);
        info!("signed out");
        Ok(())
    }

    /// Force a token refresh now, re-arming the proactive timer on success.
    pub async fn refresh(&self) -> AuthResult<()> {
        let outcome = self.gate.refresh().await?;
        self.scheduler.schedule(outcome.expires_in);
        Ok(())
    }

    /// Fetch the signed-in user.
    ///
    /// Returns `None` with no session. While offline, or when the server is
    /// transiently unreachable, the last known user is served instead of an
    /// error.
    pub async fn current_user(&self) -> AuthResult<Option<User>> {
        if !self.tokens.has_any() {
            return Ok(None);
        }
        if !self.monitor.is_online() {
            debug!("offline, serving cached user");
            return Ok(self.cached_user());
        }

        match self.gateway.send(Method::GET, endpoints::ME, None).await {
            Ok(value) => {
                let envelope: UserEnvelope = serde_json::from_value(value)?;
                if let Some(mut meta) = self.tokens.meta() {
                    meta.email = Some(envelope.user.email.clone());
                    meta.username = envelope.user.username.clone();
                    self.tokens.set_meta(meta);
                }
                *lock(&self.user) = Some(envelope.user.clone());
                Ok(Some(envelope.user))
            }
            Err(err) if err.is_transient() => {
                warn!(error = %err, "user fetch failed, serving cached user");
                Ok(self.cached_user())
            }
            Err(err) => Err(err),
        }
    }

    /// One sign-in/sign-up attempt against a credential-bearing endpoint.
    /// No bearer token, no 401 refresh; offline attempts are deferred.
    async fn credentialed_attempt(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AuthResult<User> {
        *lock(&self.last_error) = None;
        self.transition(AuthMachineInput::AttemptStarted)?;

        let result = self
            .gateway
            .send_public_or_defer(Method::POST, path, body)
            .await
            .and_then(|value| Ok(serde_json::from_value::<AuthResponse>(value)?))
            .and_then(|auth| {
                if auth.access_token.is_empty() || auth.refresh_token.is_empty() {
                    return Err(AuthError::MalformedResponse(
                        "empty token in auth response".to_string(),
                    ));
                }
                Ok(auth)
            });

        match result {
            Ok(auth) => {
                self.install_session(&auth)?;
                Ok(auth.user)
            }
            Err(err) => {
                *lock(&self.last_error) = Some(err.to_string());
                // A failed attempt cannot leave us stuck in Authenticating
                let _ = self.transition(AuthMachineInput::AttemptFailed);
                Err(err)
            }
        }
    }

    fn install_session(&self, auth: &AuthResponse) -> AuthResult<()> {
        let meta = SessionMeta {
            user_id: auth.user.id.clone(),
            email: Some(auth.user.email.clone()),
            username: auth.user.username.clone(),
            is_anonymous: auth.user.is_anonymous_account,
            created_at: auth.user.created_at.clone(),
            expires_at: api::expires_at_from(auth.expires_in),
        };
        self.tokens
            .set_session(&auth.access_token, &auth.refresh_token, meta);
        *lock(&self.user) = Some(auth.user.clone());
        *lock(&self.last_error) = None;
        self.transition(AuthMachineInput::AttemptSucceeded)?;
        self.scheduler.schedule(auth.expires_in);
        info!(user_id = %auth.user.id, anonymous = auth.user.is_anonymous_account, "signed in");
        Ok(())
    }

    fn cached_user(&self) -> Option<User> {
        lock(&self.user)
            .clone()
            .or_else(|| self.tokens.meta().map(|meta| user_from_meta(&meta)))
    }

    /// Feed one input to the state machine and publish the new state.
    fn transition(&self, input: AuthMachineInput) -> AuthResult<()> {
        {
            let mut machine = lock(&self.machine);
            let from = format!("{:?}", machine.state());
            machine.consume(&input).map_err(|_| {
                AuthError::InvalidStateTransition(format!("{input:?} in state {from}"))
            })?;
        }
        self.notify();
        Ok(())
    }

    /// Drop to the anonymous-visitor state through the machine's own exit
    /// edge. States without that edge are reset outright, so this always
    /// lands on AnonymousVisitor.
    fn force_anonymous(&self, input: AuthMachineInput, error: Option<String>) {
        {
            let mut machine = lock(&self.machine);
            if machine.consume(&input).is_err() {
                *machine = AuthMachine::new();
            }
        }
        *lock(&self.user) = None;
        *lock(&self.last_error) = error;
        self.notify();
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        debug!(state = ?snapshot.state, "auth state changed");
        if let Some(listener) = lock(&self.listener).as_ref() {
            listener(snapshot);
        }
    }
}

impl Drop for AuthController {
    fn drop(&mut self) {
        self.scheduler.cancel();
        if let Some(worker) = lock(&self.replay_worker).take() {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for AuthController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn user_from_meta(meta: &SessionMeta) -> User {
    User {
        id: meta.user_id.clone(),
        email: meta.email.clone().unwrap_or_default(),
        username: meta.username.clone(),
        wallet_address: None,
        avatar_url: None,
        is_anonymous_account: meta.is_anonymous,
        created_at: meta.created_at.clone(),
    }
}

/// Seconds until the stored expiry timestamp, if it parses.
fn remaining_lifetime_secs(meta: &SessionMeta) -> Option<i64> {
    let expires_at = meta.expires_at.as_deref()?;
    let parsed = chrono::DateTime::parse_from_rfc3339(expires_at).ok()?;
    Some((parsed.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_seconds())
}
