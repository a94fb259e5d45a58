use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work in a build plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<TaskComplexity>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            dependencies: Vec::new(),
            agent_name: String::new(),
            status: TaskStatus::Pending,
            complexity: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = agent_name.into();
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    #[default]
    Builder,
    Tester,
    Reviewer,
    Custom,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentRole::Builder => "builder",
            AgentRole::Tester => "tester",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Custom => "custom",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Done,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Done => "done",
            AgentStatus::Error => "error",
        };
        write!(f, "{}", label)
    }
}

/// A named worker that tasks are assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub role: AgentRole,
    #[serde(default)]
    pub persona: String,
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,
    #[serde(default = "default_restricted_paths")]
    pub restricted_paths: Vec<String>,
    #[serde(default)]
    pub status: AgentStatus,
}

fn default_allowed_paths() -> Vec<String> {
    vec!["src/".into(), "tests/".into()]
}
fn default_restricted_paths() -> Vec<String> {
    vec![".kiln/".into()]
}

impl Agent {
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            name: name.into(),
            role,
            persona: String::new(),
            allowed_paths: default_allowed_paths(),
            restricted_paths: default_restricted_paths(),
            status: AgentStatus::Idle,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Planning,
    Executing,
    Testing,
    Deploying,
    Reviewing,
    Done,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Planning => "planning",
            SessionState::Executing => "executing",
            SessionState::Testing => "testing",
            SessionState::Deploying => "deploying",
            SessionState::Reviewing => "reviewing",
            SessionState::Done => "done",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// BuildSession
// ---------------------------------------------------------------------------

/// Snapshot of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSession {
    pub id: Uuid,
    pub state: SessionState,
    pub spec: Option<ProjectSpec>,
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
}

impl BuildSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            spec: None,
            tasks: Vec::new(),
            agents: Vec::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.name == name)
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

impl Default for BuildSession {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// CommitRecord
// ---------------------------------------------------------------------------

/// Result of committing a task's changes. An empty `sha` means nothing was
/// committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    pub short_sha: String,
    pub message: String,
    pub agent_name: String,
    pub task_id: String,
    pub timestamp: String,
    pub files_changed: Vec<String>,
}

impl CommitRecord {
    /// A record for a commit that did not happen.
    pub fn empty(message: &str, agent_name: &str, task_id: &str) -> Self {
        Self {
            message: message.to_string(),
            agent_name: agent_name.to_string(),
            task_id: task_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sha.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ProjectSpec
// ---------------------------------------------------------------------------

/// The declarative project description a session is started with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    #[serde(default)]
    pub project: ProjectInfo,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StylePrefs>,
    #[serde(default)]
    pub skills: Vec<Skill>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub workflow: Workflow,
    #[serde(default)]
    pub deployment: Deployment,
    /// Precomputed plan consumed by `StaticPlanner`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
}

impl ProjectSpec {
    pub fn skills_in(&self, category: SkillCategory) -> impl Iterator<Item = &Skill> {
        self.skills.iter().filter(move |s| s.category == category)
    }

    pub fn rules_for(&self, trigger: RuleTrigger) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.trigger == trigger)
    }

    pub fn gates_enabled(&self) -> bool {
        !self.workflow.human_gates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default = "default_project_kind")]
    pub kind: String,
}

impl Default for ProjectInfo {
    fn default() -> Self {
        Self {
            goal: String::new(),
            description: None,
            kind: default_project_kind(),
        }
    }
}

fn default_project_kind() -> String {
    "software".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(rename = "type", default = "default_requirement_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

fn default_requirement_kind() -> String {
    "feature".into()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StylePrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCategory {
    Agent,
    Feature,
    Style,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub category: SkillCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTrigger {
    Always,
    OnTaskComplete,
    OnTestFail,
    BeforeDeploy,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub trigger: RuleTrigger,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub human_gates: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployTarget {
    #[default]
    Preview,
    Web,
    Esp32,
    Both,
    #[serde(other)]
    Other,
}

impl DeployTarget {
    pub fn includes_hardware(&self) -> bool {
        matches!(self, DeployTarget::Esp32 | DeployTarget::Both)
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeployTarget::Preview => "preview",
            DeployTarget::Web => "web",
            DeployTarget::Esp32 => "esp32",
            DeployTarget::Both => "both",
            DeployTarget::Other => "other",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub target: DeployTarget,
}
