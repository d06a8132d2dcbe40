//! Versecraft authentication and session client.
//!
//! Keeps a signed-in session alive against the Versecraft API: token
//! storage and rotation, proactive refresh scheduling, single-flight
//! refresh on 401, exponential backoff for transient failures, deferral of
//! requests made while offline, and an explicit state machine over the
//! whole lifecycle.
//!
//! [`AuthController`] is the entry point; everything else is a part it is
//! assembled from.

pub mod api;
pub mod auth_fsm;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod offline_queue;
pub mod refresh;
pub mod retry;
pub mod scheduler;

pub use api::{endpoints, AuthResponse, RefreshResponse, User, UserEnvelope};
pub use auth_fsm::AuthState;
pub use cancel::CancellationRegistry;
pub use config::Config;
pub use controller::{AuthController, AuthSnapshot, StateListener};
pub use error::{AuthError, AuthResult};
pub use gateway::HttpGateway;
pub use logging::init_logging;
pub use offline_queue::{OfflineQueue, QueuedJob};
pub use refresh::{RefreshGate, RefreshOutcome};
pub use retry::RetryPolicy;
pub use scheduler::RefreshScheduler;
