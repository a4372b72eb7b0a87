//! Capability tokens and their acknowledgment state machine.
//!
//! ```text
//! PENDING ─┬─> ACKED_IMMEDIATE ─┬─────────────> COMPLETE
//!          │                    └─> DELIVERING ─> COMPLETE
//!          └─> ACKED_DEFERRED ───> DELIVERING ─> COMPLETE
//!
//! any non-terminal state ─> EXPIRED
//! ```
//!
//! PENDING and ACKED_DEFERRED may also move straight to COMPLETE when the
//! handler fails and there is nothing left to deliver.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use super::types::{ActionId, Credential};

pub const DEFAULT_HARD_DEADLINE: Duration = Duration::from_secs(3);
pub const DEFAULT_SOFT_DEADLINE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenState {
    Pending,
    AckedImmediate,
    AckedDeferred,
    Delivering,
    Complete,
    Expired,
}

impl TokenState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenState::Complete | TokenState::Expired)
    }

    pub fn is_acknowledged(self) -> bool {
        !matches!(self, TokenState::Pending | TokenState::Expired)
    }

    pub fn can_transition_to(self, next: TokenState) -> bool {
        use TokenState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Expired) => true,
            (Pending, AckedImmediate | AckedDeferred | Complete) => true,
            (AckedImmediate, Delivering | Complete) => true,
            (AckedDeferred, Delivering | Complete) => true,
            (Delivering, Complete) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::Pending => "pending",
            TokenState::AckedImmediate => "acked_immediate",
            TokenState::AckedDeferred => "acked_deferred",
            TokenState::Delivering => "delivering",
            TokenState::Complete => "complete",
            TokenState::Expired => "expired",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal token transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TokenState,
    pub to: TokenState,
}

/// Platform-defined response windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    /// Window for the initial acknowledgment.
    pub hard: Duration,
    /// Window for every follow-up delivery.
    pub soft: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            hard: DEFAULT_HARD_DEADLINE,
            soft: DEFAULT_SOFT_DEADLINE,
        }
    }
}

/// Short-lived credential authorising responses to one inbound action.
#[derive(Debug, Clone)]
pub struct CapabilityToken {
    credential: Credential,
    issued_at: Instant,
    hard_deadline: Instant,
    soft_deadline: Instant,
    state: TokenState,
}

impl CapabilityToken {
    /// Create a PENDING token whose deadlines are measured from `issued_at`.
    pub fn issue(credential: Credential, issued_at: Instant, deadlines: Deadlines) -> Self {
        Self {
            credential,
            issued_at,
            hard_deadline: issued_at + deadlines.hard,
            soft_deadline: issued_at + deadlines.soft,
            state: TokenState::Pending,
        }
    }

    pub fn action_id(&self) -> &ActionId {
        &self.credential.action_id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn hard_deadline(&self) -> Instant {
        self.hard_deadline
    }

    pub fn soft_deadline(&self) -> Instant {
        self.soft_deadline
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued_at)
    }

    pub fn hard_remaining(&self, now: Instant) -> Duration {
        self.hard_deadline.saturating_duration_since(now)
    }

    pub fn is_past_soft(&self, now: Instant) -> bool {
        now >= self.soft_deadline
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: TokenState) -> Result<TokenState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CapabilityToken {
        CapabilityToken::issue(
            Credential::new(ActionId::from("a-1"), "secret"),
            Instant::now(),
            Deadlines::default(),
        )
    }

    #[test]
    fn deferred_path_walks_to_complete() {
        let mut token = token();

        token
            .transition(TokenState::AckedDeferred)
            .expect("pending -> deferred");
        token
            .transition(TokenState::Delivering)
            .expect("deferred -> delivering");
        token
            .transition(TokenState::Complete)
            .expect("delivering -> complete");

        assert!(token.state().is_terminal());
    }

    #[test]
    fn second_acknowledgment_is_rejected() {
        let mut token = token();
        token
            .transition(TokenState::AckedImmediate)
            .expect("first ack");

        let err = token
            .transition(TokenState::AckedDeferred)
            .expect_err("second ack must fail");
        assert_eq!(err.from, TokenState::AckedImmediate);
        assert_eq!(err.to, TokenState::AckedDeferred);
    }

    #[test]
    fn expiry_is_reachable_from_every_live_state_only() {
        for state in [
            TokenState::Pending,
            TokenState::AckedImmediate,
            TokenState::AckedDeferred,
            TokenState::Delivering,
        ] {
            assert!(state.can_transition_to(TokenState::Expired), "{state}");
        }
        assert!(!TokenState::Complete.can_transition_to(TokenState::Expired));
        assert!(!TokenState::Expired.can_transition_to(TokenState::Expired));
    }

    #[test]
    fn delivering_cannot_go_back_to_acknowledged() {
        assert!(!TokenState::Delivering.can_transition_to(TokenState::AckedDeferred));
        assert!(!TokenState::Delivering.can_transition_to(TokenState::Pending));
    }

    #[test]
    fn deadlines_are_measured_from_issue_time() {
        let issued_at = Instant::now();
        let token = CapabilityToken::issue(
            Credential::new(ActionId::from("a-2"), "secret"),
            issued_at,
            Deadlines {
                hard: Duration::from_secs(3),
                soft: Duration::from_secs(900),
            },
        );

        assert_eq!(token.hard_deadline() - issued_at, Duration::from_secs(3));
        assert_eq!(token.soft_deadline() - issued_at, Duration::from_secs(900));
        assert!(!token.is_past_soft(issued_at + Duration::from_secs(899)));
        assert!(token.is_past_soft(issued_at + Duration::from_secs(900)));
    }
}
