//! The build pipeline: plan, execute the task graph one task at a time,
//! test, optionally deploy, and report.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use kn_bridge::event_bus::EventBus;
use kn_bridge::protocol::PipelineEvent;
use kn_core::config::Config;
use kn_core::context::{
    build_current_state, build_file_manifest, build_project_context, cap_summary,
    transitive_predecessors,
};
use kn_core::dag::{DagError, TaskDag};
use kn_core::git_ops::{GitService, VersionControl};
use kn_core::types::{
    Agent, AgentRole, AgentStatus, BuildSession, CommitRecord, ProjectSpec, RuleTrigger,
    SessionState, Task, TaskStatus,
};
use kn_core::usage::TokenTracker;
use kn_harness::hardware::{Hardware, LineSink, MonitorHandle, MpremoteHardware};
use kn_harness::shutdown::StopSignal;
use kn_harness::test_runner::{PytestRunner, TestReport, TestRunner};

use crate::approval::{revision_task, HumanGate};
use crate::executor::{
    CliExecutor, ExecutionRequest, ExecutionResult, ExecutorError, OutputSink, TaskExecutor,
};
use crate::planner::{PlanError, Planner};
use crate::prompts::{self, PromptContext};
use crate::state_machine::{SessionEvent, SessionStateMachine, StateMachineError};

/// Additional attempts after the first one fails.
pub const MAX_RETRIES: u32 = 2;

pub const CHECKPOINT_QUESTION: &str =
    "I've made some progress. Want to take a look before I continue?";
pub const RETRY_QUESTION: &str =
    "We're having trouble with this part. Can you help us figure it out?";
pub const STOPPED_MESSAGE: &str = "Build stopped by user";
pub const DEADLOCK_MESSAGE: &str = "Some tasks are blocked and cannot proceed.";

const DEPLOY_TARGET: &str = "esp32";

/// Events replayed to a subscriber that attaches mid-run.
const EVENT_BACKLOG: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),
    #[error("invalid task graph: {0}")]
    Graph(#[from] DagError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error("workspace setup failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything observers can poll while a pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub session: BuildSession,
    pub commits: Vec<CommitRecord>,
    pub test_report: Option<TestReport>,
    pub tokens: TokenTracker,
}

#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<RwLock<PipelineState>>);

impl SharedState {
    pub fn read(&self) -> RwLockReadGuard<'_, PipelineState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PipelineState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The external services a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn TaskExecutor>,
    /// `None` runs without version control.
    pub vcs: Option<Arc<dyn VersionControl>>,
    pub tests: Arc<dyn TestRunner>,
    pub hardware: Arc<dyn Hardware>,
}

impl Collaborators {
    /// The shipped implementations, configured from `config`.
    pub fn from_config(config: &Config, planner: Arc<dyn Planner>) -> Self {
        Self {
            planner,
            executor: Arc::new(CliExecutor::new(&config.executor)),
            vcs: Some(Arc::new(GitService::new())),
            tests: Arc::new(PytestRunner::new(&config.tests)),
            hardware: Arc::new(MpremoteHardware::new(&config.hardware)),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Config,
    workspace: PathBuf,
    collab: Collaborators,
    events: EventBus,
    gate: Arc<HumanGate>,
    stop: StopSignal,
    state: SharedState,
    machine: SessionStateMachine,
    dag: TaskDag,
    summaries: HashMap<String, String>,
    completed: HashSet<String>,
    monitor: Option<MonitorHandle>,
}

/// Outcome of running one task through its attempts.
enum Attempts {
    Succeeded(ExecutionResult),
    Failed { reason: String, retries: u32, exhausted: bool },
}

impl Orchestrator {
    /// A pipeline for a fresh session. The workspace is
    /// `<workspace.root>/kiln-<session id>` unless overridden.
    pub fn new(config: Config, collab: Collaborators) -> Self {
        let state = SharedState::default();
        let id = state.read().session.id;
        let workspace = config.workspace.root_dir().join(format!("kiln-{id}"));
        Self {
            config,
            workspace,
            collab,
            events: EventBus::with_backlog(EVENT_BACKLOG),
            gate: Arc::new(HumanGate::new()),
            stop: StopSignal::new(),
            state,
            machine: SessionStateMachine::new(),
            dag: TaskDag::new(),
            summaries: HashMap::new(),
            completed: HashSet::new(),
            monitor: None,
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn gate(&self) -> Arc<HumanGate> {
        self.gate.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Run the whole pipeline for `spec`. Never fails: fatal errors and stop
    /// requests are reported as `error` events and leave the session `done`.
    pub async fn run(mut self, spec: ProjectSpec) {
        let stop = self.stop.clone();
        let session_id = self.state.read().session.id;
        info!(session_id = %session_id, goal = %spec.project.goal, "pipeline starting");

        let outcome = {
            let pipeline = self.run_pipeline(&spec);
            // A stop that is already pending wins over pipeline progress.
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                res = pipeline => Some(res),
            }
        };

        match outcome {
            Some(Ok(())) => info!(session_id = %session_id, "pipeline finished"),
            Some(Err(e)) => {
                error!(session_id = %session_id, error = %e, "pipeline failed");
                self.force_done();
                self.events.publish(PipelineEvent::error(e.to_string(), false));
            }
            None => {
                info!(session_id = %session_id, "pipeline stopped");
                self.gate.disarm();
                if let Some(monitor) = self.monitor.take() {
                    monitor.cancel();
                }
                self.force_done();
                self.events
                    .publish(PipelineEvent::error(STOPPED_MESSAGE, false));
            }
        }

        // The serial monitor outlives the pipeline until the board goes away
        // or the session is stopped.
        if let Some(mut monitor) = self.monitor.take() {
            tokio::select! {
                _ = monitor.wait() => debug!("serial monitor ended"),
                _ = stop.cancelled() => monitor.cancel(),
            }
        }
    }

    async fn run_pipeline(&mut self, spec: &ProjectSpec) -> Result<()> {
        self.plan(spec).await?;
        self.setup_workspace(spec).await?;
        self.execute(spec).await?;
        self.run_tests().await?;
        if spec.deployment.target.includes_hardware() {
            self.deploy(spec).await?;
        }
        self.complete()
    }

    // -- state -------------------------------------------------------------

    fn transition(&mut self, event: SessionEvent) -> Result<SessionState> {
        let next = self.machine.transition(event)?;
        self.state.write().session.state = next;
        Ok(next)
    }

    fn force_done(&mut self) {
        if self.machine.state() != SessionState::Done {
            // Stop is accepted from every state.
            let _ = self.machine.transition(SessionEvent::Stop);
        }
        self.state.write().session.state = SessionState::Done;
    }

    fn set_status(&self, task_id: &str, task: TaskStatus, agent_name: &str, agent: AgentStatus) {
        let mut st = self.state.write();
        if let Some(t) = st.session.task_mut(task_id) {
            t.status = task;
        }
        if let Some(a) = st.session.agent_mut(agent_name) {
            a.status = agent;
        }
    }

    fn task_count(&self) -> usize {
        self.state.read().session.tasks.len()
    }

    fn bookkeeping(&self) -> PathBuf {
        self.workspace.join(&self.config.workspace.bookkeeping_dir)
    }

    // -- planning ----------------------------------------------------------

    async fn plan(&mut self, spec: &ProjectSpec) -> Result<()> {
        self.transition(SessionEvent::StartPlanning)?;
        self.state.write().session.spec = Some(spec.clone());
        self.events.publish(PipelineEvent::PlanningStarted);

        for skill in &spec.skills {
            info!(name = %skill.name, category = ?skill.category, "skill loaded");
        }
        for rule in &spec.rules {
            info!(name = %rule.name, trigger = ?rule.trigger, "rule loaded");
        }

        let plan = self.collab.planner.plan(spec).await?;

        let mut dag = TaskDag::new();
        for task in &plan.tasks {
            dag.add(task.id.clone(), task.dependencies.iter().cloned())?;
        }
        let order = dag.order()?;
        debug!(order = ?order, "task order");

        let mut tasks = plan.tasks;
        for task in &mut tasks {
            task.status = TaskStatus::Pending;
        }
        let mut agents = plan.agents;
        for agent in &mut agents {
            agent.status = AgentStatus::Idle;
        }

        {
            let mut st = self.state.write();
            st.session.tasks = tasks.clone();
            st.session.agents = agents.clone();
        }
        self.dag = dag;

        info!(tasks = tasks.len(), agents = agents.len(), "plan ready");
        self.events.publish(PipelineEvent::PlanReady {
            tasks,
            agents,
            explanation: plan.explanation,
        });
        Ok(())
    }

    async fn setup_workspace(&mut self, spec: &ProjectSpec) -> Result<()> {
        let kiln = self.bookkeeping();
        for dir in [
            kiln.join("comms").join("reviews"),
            kiln.join("context"),
            kiln.join("status"),
            self.workspace.join("src"),
            self.workspace.join("tests"),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        debug!(workspace = %self.workspace.display(), "workspace created");

        if let Some(vcs) = self.collab.vcs.clone() {
            let path = self.workspace.clone();
            let goal = spec.project.goal.clone();
            let result = tokio::task::spawn_blocking(move || vcs.init_repo(&path, &goal)).await;
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                warn!(error = %reason, "repository init failed, continuing without version control");
                self.collab.vcs = None;
            }
        }
        Ok(())
    }

    // -- execution ---------------------------------------------------------

    async fn execute(&mut self, spec: &ProjectSpec) -> Result<()> {
        self.transition(SessionEvent::BeginExecution)?;

        while self.completed.len() < self.task_count() {
            let Some(task_id) = self.dag.ready(&self.completed).into_iter().next() else {
                error!(
                    completed = self.completed.len(),
                    total = self.task_count(),
                    "no task is ready"
                );
                self.events
                    .publish(PipelineEvent::error(DEADLOCK_MESSAGE, false));
                break;
            };
            self.run_task(spec, &task_id).await?;
            self.completed.insert(task_id);
        }
        Ok(())
    }

    async fn run_task(&mut self, spec: &ProjectSpec, task_id: &str) -> Result<()> {
        let (task, agent, task_map) = {
            let st = self.state.read();
            let Some(task) = st.session.task(task_id).cloned() else {
                warn!(task_id, "task vanished from session");
                return Ok(());
            };
            let agent = match st.session.agent(&task.agent_name) {
                Some(agent) => agent.clone(),
                None => {
                    warn!(task_id, agent = %task.agent_name, "unknown agent, using a builder");
                    Agent::new(task.agent_name.clone(), AgentRole::Builder)
                }
            };
            let map: HashMap<String, Task> = st
                .session
                .tasks
                .iter()
                .map(|t| (t.id.clone(), t.clone()))
                .collect();
            (task, agent, map)
        };

        self.set_status(task_id, TaskStatus::InProgress, &agent.name, AgentStatus::Working);
        info!(task_id, agent = %agent.name, role = %agent.role, "task started");
        self.events.publish(PipelineEvent::TaskStarted {
            task_id: task_id.to_string(),
            agent_name: agent.name.clone(),
        });

        let max_words = self.config.context.summary_max_words;
        let predecessors: Vec<String> = transitive_predecessors(task_id, &task_map)
            .iter()
            .filter_map(|id| self.summaries.get(id))
            .map(|s| cap_summary(s, max_words))
            .collect();
        let manifest = build_file_manifest(
            &self.workspace,
            self.config.workspace.manifest_max_entries,
            &self.config.workspace.excluded_dirs,
        );
        let system_prompt = prompts::system_prompt(&agent, task_id, spec);
        let prompt = prompts::task_prompt(
            &task,
            &agent,
            PromptContext {
                spec,
                predecessors: &predecessors,
                manifest: &manifest,
            },
        );

        match self.attempt(spec, &task, &agent, prompt, system_prompt).await {
            Attempts::Succeeded(result) => self.on_success(spec, &task, &agent, result).await,
            Attempts::Failed {
                reason,
                retries,
                exhausted,
            } => self.on_failure(&task, &agent, reason, retries, exhausted).await,
        }
    }

    /// Run the executor up to `1 + MAX_RETRIES` times.
    async fn attempt(
        &self,
        spec: &ProjectSpec,
        task: &Task,
        agent: &Agent,
        prompt: String,
        system_prompt: String,
    ) -> Attempts {
        let executor = self.collab.executor.clone();
        let timeout_secs = self.config.executor.timeout_secs;
        let retry_rules = prompts::retry_section(spec);

        let bus = self.events.clone();
        let (sink_task, sink_agent) = (task.id.clone(), agent.name.clone());
        let sink: OutputSink = Arc::new(move |line: &str| {
            bus.publish(PipelineEvent::AgentOutput {
                task_id: sink_task.clone(),
                agent_name: sink_agent.clone(),
                content: line.to_string(),
            });
        });

        let (mut input_tokens, mut output_tokens, mut cost_usd) = (0u64, 0u64, 0f64);
        let mut retries = 0u32;
        let outcome = loop {
            let mut attempt_prompt = prompt.clone();
            if retries > 0 {
                if let Some(rules) = &retry_rules {
                    attempt_prompt.push_str(rules);
                }
            }
            let request = ExecutionRequest {
                task_id: task.id.clone(),
                prompt: attempt_prompt,
                system_prompt: system_prompt.clone(),
                working_dir: self.workspace.clone(),
            };

            let call = executor.execute(request, sink.clone());
            let reason = match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await {
                Ok(Ok(result)) => {
                    input_tokens += result.input_tokens;
                    output_tokens += result.output_tokens;
                    cost_usd += result.cost_usd;
                    if result.success {
                        break Attempts::Succeeded(result);
                    }
                    result.summary
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    warn!(task_id = %task.id, error = %e, "executor error, not retrying");
                    break Attempts::Failed {
                        reason: e.to_string(),
                        retries,
                        exhausted: false,
                    };
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => ExecutorError::Timeout(timeout_secs).to_string(),
            };

            if retries >= MAX_RETRIES {
                break Attempts::Failed {
                    reason,
                    retries,
                    exhausted: true,
                };
            }
            retries += 1;
            warn!(task_id = %task.id, attempt = retries + 1, reason = %reason, "retrying task");
            self.events.publish(PipelineEvent::TaskRetry {
                task_id: task.id.clone(),
                agent_name: agent.name.clone(),
                attempt: retries + 1,
                max_attempts: MAX_RETRIES + 1,
            });
        };

        if input_tokens + output_tokens > 0 || cost_usd > 0.0 {
            self.state
                .write()
                .tokens
                .add_for_agent(&agent.name, input_tokens, output_tokens, cost_usd);
            self.events.publish(PipelineEvent::TokenUsage {
                agent_name: agent.name.clone(),
                input_tokens,
                output_tokens,
                cost_usd,
            });
        }
        outcome
    }

    async fn on_success(
        &mut self,
        spec: &ProjectSpec,
        task: &Task,
        agent: &Agent,
        result: ExecutionResult,
    ) -> Result<()> {
        self.set_status(&task.id, TaskStatus::Done, &agent.name, AgentStatus::Idle);

        let summary_file = self
            .bookkeeping()
            .join("comms")
            .join(format!("{}_summary.md", task.id));
        let summary = match tokio::fs::read_to_string(&summary_file).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => result.summary,
        };
        let summary = cap_summary(&summary, self.config.context.summary_max_words);
        self.summaries.insert(task.id.clone(), summary.clone());

        self.events.publish(PipelineEvent::AgentMessage {
            from: agent.name.clone(),
            to: "team".into(),
            content: summary
                .chars()
                .take(self.config.context.agent_message_chars)
                .collect(),
        });

        self.write_bookkeeping(&task.id).await;
        self.commit(task, agent).await;

        info!(task_id = %task.id, "task completed");
        self.events.publish(PipelineEvent::TaskCompleted {
            task_id: task.id.clone(),
            summary,
        });

        let checkpoint = self.task_count() / 2;
        if spec.gates_enabled() && checkpoint > 0 && self.completed.len() + 1 == checkpoint {
            let context = format!("Just completed: {}", task.name);
            self.fire_gate(task, CHECKPOINT_QUESTION, context).await?;
        }
        Ok(())
    }

    async fn on_failure(
        &mut self,
        task: &Task,
        agent: &Agent,
        reason: String,
        retries: u32,
        exhausted: bool,
    ) -> Result<()> {
        self.set_status(&task.id, TaskStatus::Failed, &agent.name, AgentStatus::Error);
        let reason = if reason.trim().is_empty() {
            None
        } else {
            Some(reason)
        };

        warn!(task_id = %task.id, retries, exhausted, "task failed");
        self.events.publish(PipelineEvent::TaskFailed {
            task_id: task.id.clone(),
            error: reason.clone().unwrap_or_else(|| "Unknown error".into()),
            retry_count: retries,
        });

        if exhausted {
            let context = reason.unwrap_or_else(|| "Task failed after retries".into());
            self.fire_gate(task, RETRY_QUESTION, context).await
        } else {
            self.events.publish(PipelineEvent::error(
                format!("Agent couldn't complete task: {}", task.name),
                true,
            ));
            Ok(())
        }
    }

    /// Rewrite `project_context.md` and `current_state.json`. Failures are
    /// logged.
    async fn write_bookkeeping(&self, task_id: &str) {
        let kiln = self.bookkeeping();

        let mut completed = self.completed.clone();
        completed.insert(task_id.to_string());
        let context = build_project_context(&self.summaries, &completed);
        let path = kiln.join("context").join("project_context.md");
        if let Err(e) = tokio::fs::write(&path, context).await {
            warn!(path = %path.display(), error = %e, "could not write project context");
        }

        let snapshot = {
            let st = self.state.read();
            build_current_state(&st.session.tasks, &st.session.agents)
        };
        let path = kiln.join("status").join("current_state.json");
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&path, json).await {
                    warn!(path = %path.display(), error = %e, "could not write status");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize status"),
        }
    }

    async fn commit(&self, task: &Task, agent: &Agent) {
        let Some(vcs) = self.collab.vcs.clone() else {
            return;
        };
        let path = self.workspace.clone();
        let message = format!("{}: {}", agent.name, task.name);
        let (agent_name, task_id) = (agent.name.clone(), task.id.clone());

        let result = tokio::task::spawn_blocking(move || {
            vcs.commit(&path, &message, &agent_name, &task_id)
        })
        .await;
        match result {
            Ok(Ok(record)) if record.is_empty() => debug!(task_id = %task.id, "nothing to commit"),
            Ok(Ok(record)) => {
                info!(task_id = %task.id, sha = %record.short_sha, "committed");
                self.state.write().commits.push(record.clone());
                self.events.publish(PipelineEvent::CommitCreated(record));
            }
            Ok(Err(e)) => warn!(task_id = %task.id, error = %e, "commit failed"),
            Err(e) => warn!(task_id = %task.id, error = %e, "commit task panicked"),
        }
    }

    // -- approval ----------------------------------------------------------

    async fn fire_gate(&mut self, task: &Task, question: &str, context: String) -> Result<()> {
        self.transition(SessionEvent::EnterReview)?;
        let rx = self.gate.arm();
        info!(task_id = %task.id, "waiting for approval");
        self.events.publish(PipelineEvent::HumanGate {
            task_id: task.id.clone(),
            question: question.to_string(),
            context,
        });

        // A dropped gate counts as approval.
        let response = rx.await.unwrap_or_default();
        if !response.approved {
            let feedback = response.feedback_text().unwrap_or_default();
            let revision = {
                let st = self.state.read();
                revision_task(task, feedback, |id| {
                    st.session.task(id).is_some() || self.dag.contains(id)
                })
            };
            info!(task_id = %task.id, revision = %revision.id, "changes requested");
            self.dag
                .add(revision.id.clone(), revision.dependencies.iter().cloned())?;
            self.state.write().session.tasks.push(revision);
        }

        self.transition(SessionEvent::ResumeExecution)?;
        Ok(())
    }

    // -- testing -----------------------------------------------------------

    async fn run_tests(&mut self) -> Result<()> {
        self.transition(SessionEvent::StartTesting)?;

        let report = match self.collab.tests.run_tests(&self.workspace).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "test run failed");
                self.events
                    .publish(PipelineEvent::error(format!("Tests could not run: {e}"), true));
                TestReport::default()
            }
        };

        for case in &report.tests {
            self.events.publish(PipelineEvent::TestResult {
                test_name: case.test_name.clone(),
                passed: case.passed,
                details: case.details.clone(),
            });
        }
        if let Some(percentage) = report.coverage_pct {
            self.events.publish(PipelineEvent::CoverageUpdate { percentage });
        }
        info!(total = report.total, passed = report.passed, failed = report.failed, "tests finished");
        self.state.write().test_report = Some(report);
        Ok(())
    }

    // -- deploy ------------------------------------------------------------

    fn progress(&self, step: impl Into<String>, progress: u8) {
        self.events.publish(PipelineEvent::DeployProgress {
            step: step.into(),
            progress,
        });
    }

    /// Stop the remaining deploy steps after `step` failed.
    fn deploy_failed(&self, step: String, progress: u8, error: String) {
        warn!(error = %error, "deploy step failed");
        self.progress(step, progress);
        self.events.publish(PipelineEvent::error(error, true));
    }

    async fn deploy(&mut self, spec: &ProjectSpec) -> Result<()> {
        self.transition(SessionEvent::StartDeploy)?;
        self.events.publish(PipelineEvent::DeployStarted {
            target: DEPLOY_TARGET.into(),
        });

        let checklist: Vec<String> = spec
            .rules_for(RuleTrigger::BeforeDeploy)
            .map(|r| format!("- {}: {}", r.name, r.prompt))
            .collect();
        if !checklist.is_empty() {
            info!(checklist = %checklist.join("\n"), "pre-deploy checklist");
        }

        let hardware = self.collab.hardware.clone();

        self.progress("Compiling MicroPython code...", 25);
        let errors = match hardware.compile(&self.workspace).await {
            Ok(result) if result.success => None,
            Ok(result) => Some(result.errors.join(", ")),
            Err(e) => Some(e.to_string()),
        };
        if let Some(errors) = errors {
            self.deploy_failed(
                format!("Compile failed: {errors}"),
                25,
                format!("Compilation failed: {errors}"),
            );
            return Ok(());
        }

        self.progress("Flashing to board...", 60);
        let failure = match hardware.flash(&self.workspace, None).await {
            Ok(result) if result.success => None,
            Ok(result) => Some(result.message),
            Err(e) => Some(format!("Flash failed: {e}")),
        };
        if let Some(message) = failure {
            self.deploy_failed(message.clone(), 60, message);
            return Ok(());
        }

        self.progress("Starting serial monitor...", 90);
        match hardware.detect_board().await {
            Ok(Some(board)) => {
                let bus = self.events.clone();
                let sink: LineSink = Arc::new(move |line: String| {
                    bus.publish(PipelineEvent::SerialData {
                        line,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    });
                });
                match hardware.start_monitor(&board.port, sink).await {
                    Ok(handle) => {
                        info!(port = %board.port, board = %board.board_type, "serial monitor started");
                        self.monitor = Some(handle);
                    }
                    Err(e) => warn!(port = %board.port, error = %e, "serial monitor failed"),
                }
            }
            Ok(None) => info!("no board found for serial monitoring"),
            Err(e) => warn!(error = %e, "board detection failed"),
        }

        self.events.publish(PipelineEvent::DeployComplete {
            target: DEPLOY_TARGET.into(),
        });
        Ok(())
    }

    // -- completion --------------------------------------------------------

    fn complete(&mut self) -> Result<()> {
        self.transition(SessionEvent::Finish)?;

        let summary = {
            let mut st = self.state.write();
            for agent in &mut st.session.agents {
                agent.status = AgentStatus::Done;
            }
            completion_summary(
                st.session.count_status(TaskStatus::Done),
                st.session.count_status(TaskStatus::Failed),
                st.session.tasks.len(),
                st.test_report.as_ref(),
            )
        };

        info!(summary = %summary, "session complete");
        self.events
            .publish(PipelineEvent::SessionComplete { summary });
        Ok(())
    }
}

/// `Completed X/Y tasks.` with failure and test counts appended when
/// relevant.
pub fn completion_summary(
    done: usize,
    failed: usize,
    total: usize,
    tests: Option<&TestReport>,
) -> String {
    let mut summary = format!("Completed {done}/{total} tasks.");
    if failed > 0 {
        summary.push_str(&format!(" {failed} task(s) failed."));
    }
    if let Some(report) = tests.filter(|r| r.total > 0) {
        summary.push_str(&format!(" {}/{} tests passing.", report.passed, report.total));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use kn_harness::test_runner::TestCase;

    #[test]
    fn summary_counts() {
        assert_eq!(completion_summary(3, 0, 3, None), "Completed 3/3 tasks.");
        assert_eq!(
            completion_summary(2, 1, 3, None),
            "Completed 2/3 tasks. 1 task(s) failed."
        );
        let report = TestReport::from_cases(
            vec![
                TestCase {
                    test_name: "test_a".into(),
                    passed: true,
                    details: String::new(),
                },
                TestCase {
                    test_name: "test_b".into(),
                    passed: false,
                    details: "assert 1 == 2".into(),
                },
            ],
            None,
        );
        assert_eq!(
            completion_summary(3, 0, 3, Some(&report)),
            "Completed 3/3 tasks. 1/2 tests passing."
        );
        assert_eq!(
            completion_summary(1, 0, 1, Some(&TestReport::default())),
            "Completed 1/1 tasks."
        );
    }
}
