use kn_core::types::{Agent, AgentRole, StylePrefs};

// ---------------------------------------------------------------------------
// RoleConfig - role-specific prompt shape
// ---------------------------------------------------------------------------

/// Role-specific pieces of the prompts an agent receives.
///
/// The system template may use `{agent_name}`, `{persona}`,
/// `{allowed_paths}`, `{restricted_paths}` and `{task_id}`.
pub trait RoleConfig: Send + Sync {
    fn role(&self) -> AgentRole;

    fn system_template(&self) -> &'static str;

    /// Heading placed above the task's acceptance criteria.
    fn criteria_heading(&self) -> &'static str {
        "## Acceptance Criteria to Verify"
    }

    /// Sentence introducing the predecessor summaries.
    fn predecessors_intro(&self) -> &'static str;

    /// Numbered steps appended after the history, if the role has any.
    fn instructions(&self) -> Option<&'static str> {
        None
    }

    /// Whether the project description and requirements are repeated.
    fn includes_requirements(&self) -> bool {
        false
    }

    fn style_section(&self, style: &StylePrefs) -> Option<String> {
        let _ = style;
        None
    }

    /// Render the system prompt for `agent` working on `task_id`.
    fn render_system(&self, agent: &Agent, task_id: &str) -> String {
        let allowed = if agent.allowed_paths.is_empty() {
            "src/, tests/".to_string()
        } else {
            agent.allowed_paths.join(", ")
        };
        let restricted = if agent.restricted_paths.is_empty() {
            ".kiln/".to_string()
        } else {
            agent.restricted_paths.join(", ")
        };
        self.system_template()
            .replace("{agent_name}", &agent.name)
            .replace("{persona}", &agent.persona)
            .replace("{allowed_paths}", &allowed)
            .replace("{restricted_paths}", &restricted)
            .replace("{task_id}", task_id)
    }
}

/// Look up the prompt shape for `role`. Custom agents build.
pub fn role_config(role: AgentRole) -> &'static dyn RoleConfig {
    match role {
        AgentRole::Tester => &TesterRole,
        AgentRole::Reviewer => &ReviewerRole,
        AgentRole::Builder | AgentRole::Custom => &BuilderRole,
    }
}

fn format_style(style: &StylePrefs) -> String {
    let mut parts = Vec::new();
    if let Some(colors) = &style.colors {
        parts.push(format!("Colors: {colors}"));
    }
    if let Some(theme) = &style.theme {
        parts.push(format!("Theme: {theme}"));
    }
    if let Some(tone) = &style.tone {
        parts.push(format!("Tone: {tone}"));
    }
    if parts.is_empty() {
        "No specific style preferences.".to_string()
    } else {
        parts.join("\n")
    }
}

// ===========================================================================
// BuilderRole
// ===========================================================================

const BUILDER_SYSTEM_PROMPT: &str = "\
You are {agent_name}, a builder agent working on a software project in Kiln.

## Your Persona
{persona}

## Your Role
You are a BUILDER. You write code, create files, and implement features.

## Rules
- Write clean, well-structured code appropriate for the project type.
- Follow the project's style preferences (colors, theme, tone).
- Create files ONLY within your allowed paths: {allowed_paths}
- Do NOT modify files in restricted paths: {restricted_paths}
- Keep code simple and readable.
- After completing your task, write a brief summary of what you did to \
.kiln/comms/{task_id}_summary.md (2-3 sentences max).

## Communication
When you finish, your summary file should contain:
- What files you created or modified
- What the code does in simple terms
- Any issues or notes for the next agent
";

pub struct BuilderRole;

impl RoleConfig for BuilderRole {
    fn role(&self) -> AgentRole {
        AgentRole::Builder
    }

    fn system_template(&self) -> &'static str {
        BUILDER_SYSTEM_PROMPT
    }

    fn criteria_heading(&self) -> &'static str {
        "## Acceptance Criteria"
    }

    fn predecessors_intro(&self) -> &'static str {
        "Previous agents completed these tasks. Use their output as context:"
    }

    fn includes_requirements(&self) -> bool {
        true
    }

    fn style_section(&self, style: &StylePrefs) -> Option<String> {
        Some(format!("## Style Preferences\n{}", format_style(style)))
    }
}

// ===========================================================================
// TesterRole
// ===========================================================================

const TESTER_SYSTEM_PROMPT: &str = "\
You are {agent_name}, a tester agent working on a software project in Kiln.

## Your Persona
{persona}

## Your Role
You are a TESTER. You write tests, run them, and verify that the code meets acceptance criteria.

## Rules
- Write test files that verify the acceptance criteria for the task.
- Use appropriate testing frameworks for the project type (pytest for Python, Jest/Vitest for JS/TS).
- Run the tests and report results clearly.
- Create test files ONLY within your allowed paths: {allowed_paths}
- Do NOT modify files in restricted paths: {restricted_paths}
- After completing your task, write a summary to .kiln/comms/{task_id}_summary.md.

## Reporting Format
Your summary must include:
- PASS or FAIL verdict
- List of tests written and their results
- If FAIL: what specifically failed and suggestions for fixing
";

const TESTER_INSTRUCTIONS: &str = "\
## Instructions
1. Read the code that was created by builder agents.
2. Write tests that verify each acceptance criterion.
3. Run the tests.
4. Report results in your summary file.";

pub struct TesterRole;

impl RoleConfig for TesterRole {
    fn role(&self) -> AgentRole {
        AgentRole::Tester
    }

    fn system_template(&self) -> &'static str {
        TESTER_SYSTEM_PROMPT
    }

    fn predecessors_intro(&self) -> &'static str {
        "Previous agents completed these tasks. Their code is in the workspace:"
    }

    fn instructions(&self) -> Option<&'static str> {
        Some(TESTER_INSTRUCTIONS)
    }
}

// ===========================================================================
// ReviewerRole
// ===========================================================================

const REVIEWER_SYSTEM_PROMPT: &str = "\
You are {agent_name}, a code reviewer agent working on a software project in Kiln.

## Your Persona
{persona}

## Your Role
You are a REVIEWER. You review code quality, check for issues, and suggest improvements.

## Rules
- Review all code created by builder agents for quality and correctness.
- Check that acceptance criteria are met.
- Look for: bugs, missing error handling, unclear code, style issues.
- Be constructive and encouraging.
- You MAY make small fixes directly (typos, obvious bugs).
- Create review files ONLY within your allowed paths: {allowed_paths}
- Do NOT modify files in restricted paths: {restricted_paths}
- After completing your review, write a summary to .kiln/comms/{task_id}_summary.md.

## Review Checklist
1. Does the code fulfill the task description?
2. Are all acceptance criteria met?
3. Is the code readable and well-organized?
4. Are there any bugs or edge cases?
5. Does it follow the project's style preferences?

## Reporting Format
Your summary must include:
- VERDICT: APPROVED or NEEDS_CHANGES
- SUMMARY: 1-2 sentence overview
- DETAILS: Specific findings (what's good, what could improve)
";

const REVIEWER_INSTRUCTIONS: &str = "\
## Instructions
1. Read all code in the workspace created by previous agents.
2. Check each acceptance criterion.
3. Review code quality using the checklist.
4. Make small fixes if needed.
5. Write your review verdict and details in the summary file.";

pub struct ReviewerRole;

impl RoleConfig for ReviewerRole {
    fn role(&self) -> AgentRole {
        AgentRole::Reviewer
    }

    fn system_template(&self) -> &'static str {
        REVIEWER_SYSTEM_PROMPT
    }

    fn predecessors_intro(&self) -> &'static str {
        "Previous agents completed these tasks:"
    }

    fn instructions(&self) -> Option<&'static str> {
        Some(REVIEWER_INSTRUCTIONS)
    }

    fn style_section(&self, style: &StylePrefs) -> Option<String> {
        let mut lines = vec!["## Style Preferences".to_string()];
        if let Some(colors) = &style.colors {
            lines.push(format!("Colors: {colors}"));
        }
        if let Some(theme) = &style.theme {
            lines.push(format!("Theme: {theme}"));
        }
        Some(lines.join("\n"))
    }
}
