use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use kn_bridge::event_bus::EventBus;
use kn_bridge::protocol::PipelineEvent;
use kn_core::config::Config;
use kn_core::types::{BuildSession, CommitRecord, ProjectSpec, SessionState};
use kn_core::usage::TokenTracker;
use kn_harness::shutdown::StopSignal;
use kn_harness::test_runner::TestReport;

use crate::approval::{GateError, GateResponse, HumanGate};
use crate::orchestrator::{Collaborators, Orchestrator, SharedState};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} was already started")]
    AlreadyStarted(Uuid),
}

/// Control surface for one running pipeline.
///
/// The pipeline runs on its own tokio task after [`start`](Self::start);
/// everything else here may be called from any task while it runs.
pub struct PipelineHandle {
    id: Uuid,
    workspace: PathBuf,
    events: EventBus,
    gate: Arc<HumanGate>,
    stop: StopSignal,
    state: SharedState,
    pending: Mutex<Option<Orchestrator>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineHandle {
    pub fn new(config: Config, collab: Collaborators) -> Self {
        Self::from_orchestrator(Orchestrator::new(config, collab))
    }

    /// Like [`new`](Self::new) with an explicit workspace directory.
    pub fn with_workspace(config: Config, collab: Collaborators, workspace: impl Into<PathBuf>) -> Self {
        Self::from_orchestrator(Orchestrator::new(config, collab).with_workspace(workspace))
    }

    fn from_orchestrator(orchestrator: Orchestrator) -> Self {
        let state = orchestrator.state();
        let id = state.read().session.id;
        Self {
            id,
            workspace: orchestrator.workspace().to_path_buf(),
            events: orchestrator.events(),
            gate: orchestrator.gate(),
            stop: orchestrator.stop_signal(),
            state,
            pending: Mutex::new(Some(orchestrator)),
            join: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Receive every event published from now on. Subscribe before
    /// [`start`](Self::start) to see the whole run.
    pub fn subscribe(&self) -> flume::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Spawn the pipeline. Must be called inside a tokio runtime.
    pub fn start(&self, spec: ProjectSpec) -> Result<(), SessionError> {
        let orchestrator = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::AlreadyStarted(self.id))?;
        let handle = tokio::spawn(orchestrator.run(spec));
        *self.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Ask the pipeline to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn respond_to_gate(&self, approved: bool, feedback: Option<String>) -> Result<(), GateError> {
        self.gate.respond(GateResponse { approved, feedback })
    }

    pub fn gate_pending(&self) -> bool {
        self.gate.is_pending()
    }

    pub fn state(&self) -> SessionState {
        self.state.read().session.state
    }

    pub fn session(&self) -> BuildSession {
        self.state.read().session.clone()
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state.read().commits.clone()
    }

    pub fn test_report(&self) -> Option<TestReport> {
        self.state.read().test_report.clone()
    }

    pub fn token_usage(&self) -> TokenTracker {
        self.state.read().tokens.clone()
    }

    /// Wait for the pipeline task to finish. Returns at once if it was never
    /// started or has already been awaited.
    pub async fn wait(&self) {
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(session_id = %self.id, error = %e, "pipeline task panicked");
            }
        }
    }
}
