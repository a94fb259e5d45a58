use kn_core::types::{Agent, CommitRecord, Task};
use serde::{Deserialize, Serialize};

/// Every observable change in a pipeline run, in emission order.
///
/// Serialized flat with a `type` tag, e.g.
/// `{"type":"task_started","task_id":"t1","agent_name":"Sparky"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // Planning
    PlanningStarted,
    PlanReady {
        tasks: Vec<Task>,
        agents: Vec<Agent>,
        explanation: String,
    },

    // Execution
    TaskStarted {
        task_id: String,
        agent_name: String,
    },
    AgentOutput {
        task_id: String,
        agent_name: String,
        content: String,
    },
    TaskRetry {
        task_id: String,
        agent_name: String,
        attempt: u32,
        max_attempts: u32,
    },
    TokenUsage {
        agent_name: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    AgentMessage {
        from: String,
        to: String,
        content: String,
    },
    TaskCompleted {
        task_id: String,
        summary: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
        retry_count: u32,
    },
    CommitCreated(CommitRecord),
    HumanGate {
        task_id: String,
        question: String,
        context: String,
    },

    // Testing
    TestResult {
        test_name: String,
        passed: bool,
        details: String,
    },
    CoverageUpdate {
        percentage: f64,
    },

    // Deploy
    DeployStarted {
        target: String,
    },
    DeployProgress {
        step: String,
        progress: u8,
    },
    SerialData {
        line: String,
        timestamp: String,
    },
    DeployComplete {
        target: String,
    },

    SessionComplete {
        summary: String,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

impl PipelineEvent {
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        PipelineEvent::Error {
            message: message.into(),
            recoverable,
        }
    }

    /// The `type` tag this event serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::PlanningStarted => "planning_started",
            PipelineEvent::PlanReady { .. } => "plan_ready",
            PipelineEvent::TaskStarted { .. } => "task_started",
            PipelineEvent::AgentOutput { .. } => "agent_output",
            PipelineEvent::TaskRetry { .. } => "task_retry",
            PipelineEvent::TokenUsage { .. } => "token_usage",
            PipelineEvent::AgentMessage { .. } => "agent_message",
            PipelineEvent::TaskCompleted { .. } => "task_completed",
            PipelineEvent::TaskFailed { .. } => "task_failed",
            PipelineEvent::CommitCreated(_) => "commit_created",
            PipelineEvent::HumanGate { .. } => "human_gate",
            PipelineEvent::TestResult { .. } => "test_result",
            PipelineEvent::CoverageUpdate { .. } => "coverage_update",
            PipelineEvent::DeployStarted { .. } => "deploy_started",
            PipelineEvent::DeployProgress { .. } => "deploy_progress",
            PipelineEvent::SerialData { .. } => "serial_data",
            PipelineEvent::DeployComplete { .. } => "deploy_complete",
            PipelineEvent::SessionComplete { .. } => "session_complete",
            PipelineEvent::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
