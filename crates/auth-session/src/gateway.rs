//! Authenticated HTTP gateway.
//!
//! All API traffic goes through here: bearer attachment, transient-failure
//! backoff, the 401 refresh-and-retry dance, cancellation, and deferral of
//! mutations while offline.

use crate::cancel::CancellationRegistry;
use crate::error::{AuthError, AuthResult};
use crate::offline_queue::{OfflineQueue, QueuedJob};
use crate::refresh::RefreshGate;
use crate::retry::RetryPolicy;
use connectivity_monitor::NetworkMonitor;
use credential_vault::TokenStore;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    gate: Arc<RefreshGate>,
    cancels: CancellationRegistry,
    queue: Arc<OfflineQueue>,
    monitor: Arc<dyn NetworkMonitor>,
    policy: RetryPolicy,
}

impl HttpGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        tokens: Arc<TokenStore>,
        gate: Arc<RefreshGate>,
        queue: Arc<OfflineQueue>,
        monitor: Arc<dyn NetworkMonitor>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            base_url,
            tokens,
            gate,
            cancels: CancellationRegistry::new(),
            queue,
            monitor,
            policy,
        })
    }

    /// Send an authenticated request, failing fast with
    /// [`AuthError::Offline`] when there is no connectivity.
    pub async fn send(&self, method: Method, path: &str, body: Option<Value>) -> AuthResult<Value> {
        self.send_with_id(Uuid::new_v4(), method, path, body).await
    }

    /// Like [`send`](Self::send), with a caller-chosen id that can be passed
    /// to [`cancel`](Self::cancel) from another task.
    pub async fn send_with_id(
        &self,
        id: Uuid,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> AuthResult<Value> {
        self.send_inner(id, method, path, body, true).await
    }

    /// Send without a bearer token. A 401 here means the credentials in the
    /// body are wrong; it never triggers a refresh.
    pub async fn send_public(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> AuthResult<Value> {
        self.send_inner(Uuid::new_v4(), method, path, body, false)
            .await
    }

    async fn send_inner(
        &self,
        id: Uuid,
        method: Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
    ) -> AuthResult<Value> {
        if !self.monitor.is_online() {
            return Err(AuthError::Offline);
        }

        let cancelled = self.cancels.register(id);
        let result = tokio::select! {
            biased;
            _ = cancelled => {
                debug!(request_id = %id, path, "request cancelled");
                Err(AuthError::Cancelled)
            }
            result = self.send_retried(method, path, &body, authenticated) => result,
        };
        self.cancels.complete(&id);
        result
    }

    /// Defer a mutation to the offline queue when there is no connectivity.
    /// The call resolves once the request has actually run, which for a
    /// deferred request means after reconnect.
    pub async fn send_or_defer(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> AuthResult<Value> {
        self.defer_inner(method, path, body, true).await
    }

    /// [`send_public`](Self::send_public) with offline deferral.
    pub async fn send_public_or_defer(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> AuthResult<Value> {
        self.defer_inner(method, path, body, false).await
    }

    async fn defer_inner(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
    ) -> AuthResult<Value> {
        if self.monitor.is_online() {
            return self
                .send_inner(Uuid::new_v4(), method, path, body, authenticated)
                .await;
        }

        let id = Uuid::new_v4();
        info!(request_id = %id, path, "offline, deferring request");

        let (tx, rx) = oneshot::channel();
        let gateway = Arc::clone(self);
        let path_owned = path.to_string();
        let job = QueuedJob::new(id, move || {
            Box::pin(async move {
                let result = gateway
                    .send_inner(id, method, &path_owned, body, authenticated)
                    .await;
                let _ = tx.send(result);
            })
        });
        self.queue.enqueue(job).await?;

        rx.await.map_err(|_| AuthError::QueueClosed)?
    }

    /// Abandon a single in-flight request.
    pub fn cancel(&self, id: &Uuid) -> bool {
        self.cancels.cancel(id)
    }

    /// Abandon everything in flight. Returns how many requests were dropped.
    pub fn cancel_all(&self) -> usize {
        self.cancels.cancel_all()
    }

    /// One logical request wrapped in transient-failure backoff. Each attempt
    /// gets its own 401 refresh-and-resend chance.
    async fn send_retried(
        &self,
        method: Method,
        path: &str,
        body: &Option<Value>,
        authenticated: bool,
    ) -> AuthResult<Value> {
        self.policy
            .run(path, |_attempt| {
                let method = method.clone();
                async move { self.attempt(method, path, body, authenticated).await }
            })
            .await
    }

    async fn attempt(
        &self,
        method: Method,
        path: &str,
        body: &Option<Value>,
        authenticated: bool,
    ) -> AuthResult<Value> {
        let bearer = if authenticated {
            self.tokens.access()
        } else {
            None
        };
        let response = self.dispatch(method.clone(), path, body, bearer).await?;
        let status = response.status();

        if status.as_u16() == 401 && authenticated {
            // Access token stale; refresh once and resend with the new one
            debug!(path, "got 401, refreshing before resend");
            let outcome = self.gate.refresh().await?;
            let retried = self
                .dispatch(method, path, body, Some(outcome.access_token))
                .await?;
            return Self::into_json(retried).await;
        }

        Self::into_json(response).await
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        body: &Option<Value>,
        bearer: Option<String>,
    ) -> AuthResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn into_json(response: reqwest::Response) -> AuthResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "request failed");
            return Err(AuthError::from_status(status.as_u16(), body));
        }
        if status.as_u16() == 204 {
            return Ok(Value::Null);
        }
        let text = response.text().await?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field("inflight", &self.cancels.len())
            .finish_non_exhaustive()
    }
}
