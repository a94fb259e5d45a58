use serde::{Deserialize, Serialize};
use std::fmt;

use kn_core::types::SessionState;

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    StartPlanning,
    BeginExecution,
    EnterReview,
    ResumeExecution,
    StartTesting,
    StartDeploy,
    Finish,
    Stop,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionEvent::StartPlanning => "StartPlanning",
            SessionEvent::BeginExecution => "BeginExecution",
            SessionEvent::EnterReview => "EnterReview",
            SessionEvent::ResumeExecution => "ResumeExecution",
            SessionEvent::StartTesting => "StartTesting",
            SessionEvent::StartDeploy => "StartDeploy",
            SessionEvent::Finish => "Finish",
            SessionEvent::Stop => "Stop",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: SessionState,
        event: SessionEvent,
    },
}

// ---------------------------------------------------------------------------
// SessionStateMachine
// ---------------------------------------------------------------------------

/// Lifecycle of a build session.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionState,
    history: Vec<(SessionState, SessionEvent, SessionState)>,
}

impl SessionStateMachine {
    /// Create a new state machine starting in `Idle`.
    pub fn new() -> Self {
        Self {
            current: SessionState::Idle,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.current
    }

    pub fn history(&self) -> &[(SessionState, SessionEvent, SessionState)] {
        &self.history
    }

    fn next(state: SessionState, event: SessionEvent) -> Option<SessionState> {
        let next = match (state, event) {
            (SessionState::Idle, SessionEvent::StartPlanning) => SessionState::Planning,
            (SessionState::Planning, SessionEvent::BeginExecution) => SessionState::Executing,
            (SessionState::Executing, SessionEvent::EnterReview) => SessionState::Reviewing,
            (SessionState::Reviewing, SessionEvent::ResumeExecution) => SessionState::Executing,
            (SessionState::Executing, SessionEvent::StartTesting) => SessionState::Testing,
            (SessionState::Testing, SessionEvent::StartDeploy) => SessionState::Deploying,
            (SessionState::Testing, SessionEvent::Finish) => SessionState::Done,
            (SessionState::Deploying, SessionEvent::Finish) => SessionState::Done,
            (_, SessionEvent::Stop) => SessionState::Done,
            _ => return None,
        };
        Some(next)
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Idle      + StartPlanning   -> Planning
    /// - Planning  + BeginExecution  -> Executing
    /// - Executing + EnterReview     -> Reviewing
    /// - Reviewing + ResumeExecution -> Executing
    /// - Executing + StartTesting    -> Testing
    /// - Testing   + StartDeploy     -> Deploying
    /// - Testing   + Finish          -> Done
    /// - Deploying + Finish          -> Done
    /// - any       + Stop            -> Done
    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionState, StateMachineError> {
        let next = Self::next(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "session state transition");
        Ok(next)
    }

    /// Returns `true` if the given event is valid in the current state.
    pub fn can_transition(&self, event: SessionEvent) -> bool {
        Self::next(self.current, event).is_some()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_to_done() {
        let mut sm = SessionStateMachine::new();
        for event in [
            SessionEvent::StartPlanning,
            SessionEvent::BeginExecution,
            SessionEvent::EnterReview,
            SessionEvent::ResumeExecution,
            SessionEvent::StartTesting,
            SessionEvent::StartDeploy,
            SessionEvent::Finish,
        ] {
            sm.transition(event).unwrap();
        }
        assert_eq!(sm.state(), SessionState::Done);
        assert_eq!(sm.history().len(), 7);
        assert_eq!(
            sm.history()[2],
            (SessionState::Executing, SessionEvent::EnterReview, SessionState::Reviewing)
        );
    }

    #[test]
    fn testing_can_finish_without_deploy() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionEvent::StartPlanning).unwrap();
        sm.transition(SessionEvent::BeginExecution).unwrap();
        sm.transition(SessionEvent::StartTesting).unwrap();
        assert_eq!(sm.transition(SessionEvent::Finish).unwrap(), SessionState::Done);
    }

    #[test]
    fn invalid_transition_keeps_state() {
        let mut sm = SessionStateMachine::new();
        let err = sm.transition(SessionEvent::StartTesting).unwrap_err();
        assert!(err.to_string().contains("StartTesting"));
        assert_eq!(sm.state(), SessionState::Idle);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn stop_is_valid_everywhere() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionEvent::StartPlanning).unwrap();
        sm.transition(SessionEvent::BeginExecution).unwrap();
        sm.transition(SessionEvent::EnterReview).unwrap();
        assert!(sm.can_transition(SessionEvent::Stop));
        assert!(!sm.can_transition(SessionEvent::StartTesting));
        assert_eq!(sm.transition(SessionEvent::Stop).unwrap(), SessionState::Done);
        assert!(sm.can_transition(SessionEvent::Stop));
    }
}
