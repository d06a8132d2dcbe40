//! Authentication state machine using rust-fsm.
//!
//! An explicit finite state machine for the client's auth lifecycle, instead
//! of deriving state from token-store checks.
//!
//! ## State Diagram
//!
//! ```text
//! ┌──────────────────┐
//! │ AnonymousVisitor │ (initial)
//! └────────┬─────────┘
//!          │ AttemptStarted
//!          ▼
//! ┌──────────────────┐  AttemptFailed   ┌──────────────────┐
//! │  Authenticating  │ ───────────────► │      Error       │
//! └────────┬─────────┘                  └────────┬─────────┘
//!          │ AttemptSucceeded                    │ AttemptStarted
//!          ▼                                     ▼
//! ┌──────────────────┐                    (back to Authenticating)
//! │  Authenticated   │
//! └────────┬─────────┘
//!          │ SignedOut / SessionRevoked
//!          ▼
//!    AnonymousVisitor
//! ```

use rust_fsm::*;
use serde::{Deserialize, Serialize};

// Declarative FSM definition. Generates a module `auth_machine` with:
// - auth_machine::State (enum)
// - auth_machine::Input (enum)
// - auth_machine::StateMachine (type alias)
state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub auth_machine(AnonymousVisitor)

    AnonymousVisitor => {
        AttemptStarted => Authenticating
    },
    Authenticating => {
        AttemptSucceeded => Authenticated,
        AttemptFailed => Error,
        SignedOut => AnonymousVisitor
    },
    Authenticated => {
        // Starting a new attempt (e.g. switching accounts) is allowed
        AttemptStarted => Authenticating,
        SignedOut => AnonymousVisitor,
        // Terminal refresh failure expels the session
        SessionRevoked => AnonymousVisitor
    },
    Error => {
        AttemptStarted => Authenticating,
        SignedOut => AnonymousVisitor
    }
}

// Re-export the generated types with clearer names
pub use auth_machine::Input as AuthMachineInput;
pub use auth_machine::State as AuthMachineState;
pub use auth_machine::StateMachine as AuthMachine;

/// Auth state as published to the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No registered session; browsing as an anonymous visitor.
    AnonymousVisitor,
    /// A sign-in/sign-up/restore attempt is in flight.
    Authenticating,
    /// Signed in with a live session.
    Authenticated,
    /// The last attempt failed; error message available in the snapshot.
    Error,
}

impl AuthState {
    /// Returns true only for a live registered session.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated)
    }

    /// Returns true while an attempt is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, AuthState::Authenticating)
    }
}

impl From<&AuthMachineState> for AuthState {
    fn from(state: &AuthMachineState) -> Self {
        match state {
            AuthMachineState::AnonymousVisitor => AuthState::AnonymousVisitor,
            AuthMachineState::Authenticating => AuthState::Authenticating,
            AuthMachineState::Authenticated => AuthState::Authenticated,
            AuthMachineState::Error => AuthState::Error,
        }
    }
}
