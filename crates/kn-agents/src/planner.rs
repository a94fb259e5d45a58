use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use kn_core::types::{Agent, ProjectSpec, Task};

use crate::executor::{ExecutionRequest, ExecutorError, OutputSink, TaskExecutor};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Tasks and agents produced for a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    #[serde(default, rename = "plan_explanation", alias = "explanation")]
    pub explanation: String,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("the project has no plan")]
    Missing,
    #[error("could not read plan: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse plan: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid plan: {0}")]
    Invalid(String),
    #[error("planner agent failed: {0}")]
    Executor(#[from] ExecutorError),
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// Check the plan's internal references. Cycles are left to the graph.
pub fn validate_plan(plan: &Plan) -> Result<()> {
    let mut agent_names = HashSet::new();
    for agent in &plan.agents {
        if !agent_names.insert(agent.name.as_str()) {
            return Err(PlanError::Invalid(format!("duplicate agent {}", agent.name)));
        }
    }

    let mut task_ids = HashSet::new();
    for task in &plan.tasks {
        if task.id.trim().is_empty() {
            return Err(PlanError::Invalid(format!("task {:?} has an empty id", task.name)));
        }
        if !task_ids.insert(task.id.as_str()) {
            return Err(PlanError::Invalid(format!("duplicate task {}", task.id)));
        }
        if !agent_names.contains(task.agent_name.as_str()) {
            return Err(PlanError::Invalid(format!(
                "task {} is assigned to unknown agent {:?}",
                task.id, task.agent_name
            )));
        }
    }

    for task in &plan.tasks {
        if let Some(dep) = task.dependencies.iter().find(|d| !task_ids.contains(d.as_str())) {
            return Err(PlanError::Invalid(format!(
                "task {} depends on unknown task {}",
                task.id, dep
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, spec: &ProjectSpec) -> Result<Plan>;
}

#[derive(Debug, Clone)]
enum PlanSource {
    Spec,
    File(PathBuf),
    Fixed(Plan),
}

/// Serves a precomputed plan: embedded in the spec's `plan` field, read from
/// a JSON file, or given directly.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    source: PlanSource,
}

impl StaticPlanner {
    pub fn from_spec() -> Self {
        Self {
            source: PlanSource::Spec,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: PlanSource::File(path.into()),
        }
    }

    pub fn fixed(plan: Plan) -> Self {
        Self {
            source: PlanSource::Fixed(plan),
        }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, spec: &ProjectSpec) -> Result<Plan> {
        let plan = match &self.source {
            PlanSource::Spec => {
                let value = spec.plan.clone().ok_or(PlanError::Missing)?;
                serde_json::from_value(value)?
            }
            PlanSource::File(path) => {
                let text = tokio::fs::read_to_string(path).await?;
                serde_json::from_str(&text)?
            }
            PlanSource::Fixed(plan) => plan.clone(),
        };
        validate_plan(&plan)?;
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// AgentPlanner
// ---------------------------------------------------------------------------

const PLANNER_SYSTEM_PROMPT: &str = "\
You are the planner for Kiln, which orchestrates AI agents to build software projects.
Decompose the ProjectSpec you are given into a task DAG that agents execute one at a time.

Rules:
- Each task is small enough for one agent to finish in a single session.
- Every task has testable acceptance criteria.
- Dependencies form a DAG; no circular dependencies.
- Scaffolding first, then features, then tests, then review.
- Include at least one tester task and one reviewer task.
- Every agent_name must match an agent; every dependency must name a task.
- Agent roles are builder, tester or reviewer. Give each agent a persona,
  allowed_paths and restricted_paths (always restrict .kiln/).

Output ONLY a JSON object of this shape, with no markdown fences:
{\"tasks\": [{\"id\": \"task-1\", \"name\": \"...\", \"description\": \"...\",
  \"acceptance_criteria\": [\"...\"], \"dependencies\": [], \"agent_name\": \"...\",
  \"complexity\": \"simple\"}],
 \"agents\": [{\"name\": \"...\", \"role\": \"builder\", \"persona\": \"...\",
  \"allowed_paths\": [\"src/\"], \"restricted_paths\": [\".kiln/\"]}],
 \"plan_explanation\": \"...\"}
";

/// Asks the coding agent itself to produce the plan.
pub struct AgentPlanner {
    executor: Arc<dyn TaskExecutor>,
    working_dir: PathBuf,
}

impl AgentPlanner {
    pub fn new(executor: Arc<dyn TaskExecutor>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            working_dir: working_dir.into(),
        }
    }
}

/// Pull the JSON object out of agent output that may be wrapped in prose or
/// markdown fences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[async_trait]
impl Planner for AgentPlanner {
    async fn plan(&self, spec: &ProjectSpec) -> Result<Plan> {
        let mut spec = spec.clone();
        spec.plan = None;
        let prompt = format!(
            "Decompose this project into a task DAG.\n\nProjectSpec:\n{}",
            serde_json::to_string_pretty(&spec)?
        );
        let sink: OutputSink = Arc::new(|_line: &str| {});
        let result = self
            .executor
            .execute(
                ExecutionRequest {
                    task_id: "plan".into(),
                    prompt,
                    system_prompt: PLANNER_SYSTEM_PROMPT.into(),
                    working_dir: self.working_dir.clone(),
                },
                sink,
            )
            .await?;
        if !result.success {
            return Err(PlanError::Invalid(result.summary));
        }

        let json = extract_json_object(&result.summary)
            .ok_or_else(|| PlanError::Invalid("planner returned no JSON object".into()))?;
        let plan: Plan = serde_json::from_str(json)?;
        validate_plan(&plan)?;
        info!(tasks = plan.tasks.len(), agents = plan.agents.len(), "plan generated");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use kn_core::types::AgentRole;

    fn plan() -> Plan {
        Plan {
            tasks: vec![
                Task::new("t1", "Scaffold").with_agent("Sparky"),
                Task::new("t2", "Test").with_agent("Checkers").with_dependencies(["t1"]),
            ],
            agents: vec![
                Agent::new("Sparky", AgentRole::Builder),
                Agent::new("Checkers", AgentRole::Tester),
            ],
            explanation: "Build then test".into(),
        }
    }

    #[test]
    fn valid_plan_passes() {
        assert!(validate_plan(&plan()).is_ok());
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let mut p = plan();
        p.tasks[0].agent_name = "Ghost".into();
        let err = validate_plan(&p).unwrap_err();
        assert!(err.to_string().contains("unknown agent"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut p = plan();
        p.tasks[1].dependencies = vec!["t9".into()];
        assert!(matches!(validate_plan(&p), Err(PlanError::Invalid(_))));
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let mut p = plan();
        p.tasks[1].id = "t1".into();
        p.tasks[1].dependencies.clear();
        assert!(validate_plan(&p).unwrap_err().to_string().contains("duplicate task"));
    }

    #[test]
    fn plan_reads_plan_explanation_key() {
        let p: Plan = serde_json::from_str(
            r#"{"tasks": [], "agents": [], "plan_explanation": "nothing to do"}"#,
        )
        .unwrap();
        assert_eq!(p.explanation, "nothing to do");
    }

    #[tokio::test]
    async fn static_planner_reads_spec_plan() {
        let mut spec = ProjectSpec::default();
        spec.plan = Some(serde_json::to_value(plan()).unwrap());
        let p = StaticPlanner::from_spec().plan(&spec).await.unwrap();
        assert_eq!(p.tasks.len(), 2);
        assert_eq!(p.explanation, "Build then test");
    }

    #[tokio::test]
    async fn static_planner_without_plan_errors() {
        let err = StaticPlanner::from_spec()
            .plan(&ProjectSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Missing));
    }

    #[tokio::test]
    async fn static_planner_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, serde_json::to_string(&plan()).unwrap()).unwrap();
        let p = StaticPlanner::from_file(&path)
            .plan(&ProjectSpec::default())
            .await
            .unwrap();
        assert_eq!(p.agents[1].role, AgentRole::Tester);
    }

    #[test]
    fn json_is_extracted_from_fences() {
        let text = "Here you go:\n```json\n{\"tasks\": []}\n```";
        assert_eq!(extract_json_object(text), Some("{\"tasks\": []}"));
        assert_eq!(extract_json_object("no json"), None);
    }

    struct CannedExecutor(String);

    #[async_trait]
    impl TaskExecutor for CannedExecutor {
        async fn execute(
            &self,
            request: ExecutionRequest,
            _output: OutputSink,
        ) -> crate::executor::Result<ExecutionResult> {
            assert!(request.prompt.contains("ProjectSpec"));
            Ok(ExecutionResult::succeeded(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn agent_planner_parses_output() {
        let output = format!("```json\n{}\n```", serde_json::to_string(&plan()).unwrap());
        let planner = AgentPlanner::new(Arc::new(CannedExecutor(output)), ".");
        let p = planner.plan(&ProjectSpec::default()).await.unwrap();
        assert_eq!(p.tasks[1].dependencies, vec!["t1"]);
    }
}
