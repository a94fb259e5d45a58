//! Human approval gate and revision tasks.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use kn_core::types::{Task, TaskStatus};

/// A person's answer to a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResponse {
    #[serde(default = "default_approved")]
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

fn default_approved() -> bool {
    true
}

impl GateResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: None,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: Some(feedback.into()),
        }
    }

    /// Trimmed feedback, `None` when missing or blank.
    pub fn feedback_text(&self) -> Option<&str> {
        self.feedback
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }
}

impl Default for GateResponse {
    fn default() -> Self {
        Self::approve()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("no approval is pending")]
    NotPending,
    #[error("the pipeline stopped waiting for this approval")]
    Closed,
}

/// Single-slot rendezvous between the pipeline and whoever answers gates.
#[derive(Debug, Default)]
pub struct HumanGate {
    pending: Mutex<Option<oneshot::Sender<GateResponse>>>,
}

impl HumanGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate and return the receiving end. Any earlier unanswered
    /// gate is dropped.
    pub fn arm(&self) -> oneshot::Receiver<GateResponse> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Deliver `response` to the open gate.
    pub fn respond(&self, response: GateResponse) -> Result<(), GateError> {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(GateError::NotPending)?;
        sender.send(response).map_err(|_| GateError::Closed)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Close the gate without answering.
    pub fn disarm(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Build the follow-up task for rejected work. `exists` reports ids already
/// taken; a numeric suffix is added until the id is free.
pub fn revision_task(original: &Task, feedback: &str, exists: impl Fn(&str) -> bool) -> Task {
    let base = format!("task-revision-{}", original.id);
    let mut id = base.clone();
    let mut n = 2;
    while exists(&id) {
        id = format!("{base}-{n}");
        n += 1;
    }

    Task {
        id,
        name: format!("Revise: {}", original.name),
        description: format!("Revise based on feedback: {feedback}"),
        acceptance_criteria: vec![format!("Address feedback: {feedback}")],
        dependencies: vec![original.id.clone()],
        agent_name: original.agent_name.clone(),
        status: TaskStatus::Pending,
        complexity: original.complexity,
    }
}
