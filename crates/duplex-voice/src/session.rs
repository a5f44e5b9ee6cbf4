//! Session identity and state.
//!
//! The controller is the only writer; every worker holds a [`SessionGate`]
//! and asks it whether work is still accepted before producing side effects.

use crate::error::{SessionError, SessionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle states. Draining and Closed are terminal for work acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Initializing,
    Active,
    /// Playback is being cut after a barge-in; uplink keeps flowing.
    Interrupting,
    Draining,
    Closed,
}

impl SessionState {
    /// Downlink audio may be decoded and scheduled.
    pub fn is_accepting_work(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// Captured media may still be sent upstream.
    pub fn accepts_uplink(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Interrupting)
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self, SessionState::Draining | SessionState::Closed)
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Initializing, Active) | (Initializing, Draining) | (Initializing, Closed) => true,
            (Active, Interrupting) | (Active, Draining) => true,
            (Interrupting, Active) | (Interrupting, Draining) => true,
            (Draining, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Interrupting => "interrupting",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One live conversation.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Initializing);
        let session = Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state_tx,
        };
        debug!("Session {} created", session.id);
        session
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_accepting_work(&self) -> bool {
        self.state().is_accepting_work()
    }

    /// Move to `next`. Repeating the current state is a no-op; anything not on
    /// the lifecycle graph is rejected.
    pub fn transition(&self, next: SessionState) -> SessionResult<SessionState> {
        let current = self.state();
        if current == next {
            return Ok(current);
        }
        if !current.can_transition_to(next) {
            return Err(SessionError::State(format!(
                "illegal session transition {} -> {}",
                current, next
            )));
        }
        self.state_tx.send_replace(next);
        info!("🔁 Session {}: {} -> {}", self.id, current, next);
        Ok(current)
    }

    pub fn gate(&self) -> SessionGate {
        SessionGate {
            rx: self.state_tx.subscribe(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the session state, cloned into every worker.
#[derive(Debug, Clone)]
pub struct SessionGate {
    rx: watch::Receiver<SessionState>,
}

impl SessionGate {
    pub fn state(&self) -> SessionState {
        *self.rx.borrow()
    }

    pub fn is_accepting_work(&self) -> bool {
        self.state().is_accepting_work()
    }

    pub fn accepts_uplink(&self) -> bool {
        self.state().accepts_uplink()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().is_shutting_down()
    }

    /// Resolves once the session starts draining (or the controller is gone).
    pub async fn shutting_down(&mut self) {
        let _ = self.rx.wait_for(|s| s.is_shutting_down()).await;
    }

    /// Resolves once the session is fully closed (or the controller is gone).
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Receiver for callers that want every change.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_accepts_work() {
        assert!(SessionState::Active.is_accepting_work());
        assert!(!SessionState::Initializing.is_accepting_work());
        assert!(!SessionState::Interrupting.is_accepting_work());
        assert!(!SessionState::Draining.is_accepting_work());
        assert!(SessionState::Interrupting.accepts_uplink());
        assert!(!SessionState::Draining.accepts_uplink());
    }

    #[test]
    fn transitions_follow_lifecycle() {
        let session = Session::new();
        let gate = session.gate();
        assert_eq!(gate.state(), SessionState::Initializing);

        session.transition(SessionState::Active).unwrap();
        assert!(gate.is_accepting_work());

        session.transition(SessionState::Interrupting).unwrap();
        session.transition(SessionState::Active).unwrap();
        session.transition(SessionState::Draining).unwrap();
        assert!(!gate.is_accepting_work());
        assert!(session.transition(SessionState::Active).is_err());

        session.transition(SessionState::Closed).unwrap();
        assert!(session.transition(SessionState::Closed).is_ok());
    }

    #[tokio::test]
    async fn gate_observes_close() {
        let session = Session::new();
        let mut gate = session.gate();
        session.transition(SessionState::Active).unwrap();
        let waiter = tokio::spawn(async move {
            gate.closed().await;
            gate.state()
        });
        session.transition(SessionState::Draining).unwrap();
        session.transition(SessionState::Closed).unwrap();
        assert_eq!(waiter.await.unwrap(), SessionState::Closed);
    }
}
