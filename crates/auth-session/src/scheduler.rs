//! Proactive refresh scheduling.
//!
//! Instead of waiting for a 401, the scheduler refreshes the access token
//! shortly before it expires. At most one timer exists at a time; arming a
//! new one replaces the old.

use crate::error::AuthResult;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Refresh this long before the token expires.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Never arm a timer shorter than this, even for tokens about to expire.
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(30);

/// Timer used when the server did not report a token lifetime.
pub const FALLBACK_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Delay before retrying after a transient refresh failure.
pub const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Performs one refresh and reports the new token lifetime in seconds, if
/// the server sent one.
pub type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, AuthResult<Option<i64>>> + Send + Sync>;

pub struct RefreshScheduler {
    refresh: RefreshFn,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(refresh: RefreshFn) -> Arc<Self> {
        Arc::new(Self {
            refresh,
            timer: Mutex::new(None),
        })
    }

    /// Delay until the next proactive refresh for a token with the given
    /// lifetime in seconds.
    pub fn delay_for(expires_in: Option<i64>) -> Duration {
        match expires_in {
            Some(secs) if secs > 0 => {
                let lifetime = Duration::from_secs(secs as u64);
                lifetime
                    .saturating_sub(REFRESH_MARGIN)
                    .max(MIN_REFRESH_DELAY)
            }
            Some(_) => MIN_REFRESH_DELAY,
            None => FALLBACK_REFRESH_INTERVAL,
        }
    }

    /// Arm the refresh timer for a token with the given lifetime, replacing
    /// any existing timer. The timer keeps re-arming itself after each
    /// refresh until a terminal failure or [`cancel`](Self::cancel).
    pub fn schedule(self: &Arc<Self>, expires_in: Option<i64>) {
        let mut delay = Self::delay_for(expires_in);
        debug!(delay_secs = delay.as_secs(), "arming refresh timer");

        let refresh = Arc::clone(&self.refresh);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                match (refresh)().await {
                    Ok(next_expires_in) => {
                        delay = Self::delay_for(next_expires_in);
                        debug!(delay_secs = delay.as_secs(), "refresh timer re-armed");
                    }
                    Err(err) if err.is_transient() => {
                        delay = FAILURE_RETRY_DELAY;
                        warn!(
                            error = %err,
                            retry_secs = delay.as_secs(),
                            "scheduled refresh failed, retrying"
                        );
                    }
                    Err(err) => {
                        // Session is gone; the gate already tore it down
                        info!(error = %err, "scheduled refresh failed terminally, timer stopping");
                        break;
                    }
                }
            }
        });

        let previous = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the timer. Safe to call with no timer armed.
    pub fn cancel(&self) {
        let previous = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(previous) = previous {
            debug!("refresh timer cancelled");
            previous.abort();
        }
    }

    /// Whether a timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_honors_margin_and_floor() {
        assert_eq!(
            RefreshScheduler::delay_for(Some(3600)),
            Duration::from_secs(3540)
        );
        assert_eq!(
            RefreshScheduler::delay_for(Some(45)),
            MIN_REFRESH_DELAY
        );
        assert_eq!(RefreshScheduler::delay_for(Some(0)), MIN_REFRESH_DELAY);
        assert_eq!(RefreshScheduler::delay_for(Some(-5)), MIN_REFRESH_DELAY);
        assert_eq!(
            RefreshScheduler::delay_for(None),
            FALLBACK_REFRESH_INTERVAL
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_and_rearms() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let refresh: RefreshFn = Arc::new(move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(100))
            }
            .boxed()
        });

        let scheduler = RefreshScheduler::new(refresh);
        scheduler.schedule(Some(100));

        // 100s lifetime, 60s margin: fires at t=40, re-arms for another 40
        tokio::time::sleep(Duration::from_secs(85)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        scheduler.cancel();
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let refresh: RefreshFn = Arc::new(move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
            .boxed()
        });

        let scheduler = RefreshScheduler::new(refresh);
        scheduler.schedule(Some(100));
        scheduler.schedule(Some(100));
        scheduler.schedule(Some(100));

        // One timer, one firing at t=40
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        scheduler.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_sooner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let refresh: RefreshFn = Arc::new(move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AuthError::NetworkUnavailable)
            }
            .boxed()
        });

        let scheduler = RefreshScheduler::new(refresh);
        scheduler.schedule(Some(100));

        // Fires at t=40, then retries every 30s
        tokio::time::sleep(Duration::from_secs(105)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        scheduler.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_stops_the_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let refresh: RefreshFn = Arc::new(move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AuthError::RefreshExhausted)
            }
            .boxed()
        });

        let scheduler = RefreshScheduler::new(refresh);
        scheduler.schedule(Some(100));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed());
    }
}
