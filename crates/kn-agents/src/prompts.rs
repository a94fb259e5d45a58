//! Prompt assembly for task execution.
//!
//! The system prompt comes from the agent's role plus agent-category skills
//! and `always` rules. The user prompt describes the task, the project and
//! what earlier tasks produced.

use kn_core::types::{Agent, ProjectSpec, RuleTrigger, SkillCategory, Task};

use crate::roles::role_config;

/// Everything a user prompt is built from besides the task itself.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub spec: &'a ProjectSpec,
    /// Capped summaries of the task's transitive predecessors.
    pub predecessors: &'a [String],
    /// Workspace file manifest, possibly empty.
    pub manifest: &'a str,
}

pub fn system_prompt(agent: &Agent, task_id: &str, spec: &ProjectSpec) -> String {
    let mut prompt = role_config(agent.role).render_system(agent, task_id);

    let skills: Vec<_> = spec.skills_in(SkillCategory::Agent).collect();
    let rules: Vec<_> = spec.rules_for(RuleTrigger::Always).collect();
    if !skills.is_empty() || !rules.is_empty() {
        prompt.push_str("\n\n## Custom Instructions\n");
        for s in skills {
            prompt.push_str(&format!("### Skill: {}\n{}\n\n", s.name, s.prompt));
        }
        for r in rules {
            prompt.push_str(&format!("### Rule: {}\n{}\n\n", r.name, r.prompt));
        }
    }
    prompt
}

pub fn task_prompt(task: &Task, agent: &Agent, ctx: PromptContext<'_>) -> String {
    let role = role_config(agent.role);
    let spec = ctx.spec;

    let mut parts = vec![
        format!("# Task: {}", task.name),
        format!("\n## Description\n{}", task.description),
    ];

    if !task.acceptance_criteria.is_empty() {
        parts.push(format!("\n{}", role.criteria_heading()));
        for criterion in &task.acceptance_criteria {
            parts.push(format!("- {criterion}"));
        }
    }

    let goal = if spec.project.goal.is_empty() {
        "Not specified"
    } else {
        spec.project.goal.as_str()
    };
    parts.push(format!("\n## Project Context\nGoal: {goal}"));

    if role.includes_requirements() {
        if let Some(description) = &spec.project.description {
            parts.push(format!("Description: {description}"));
        }
        if !spec.requirements.is_empty() {
            parts.push("\n## Project Requirements".to_string());
            for req in &spec.requirements {
                parts.push(format!("- [{}] {}", req.kind, req.description));
            }
        }
    }

    if let Some(section) = spec.style.as_ref().and_then(|s| role.style_section(s)) {
        parts.push(format!("\n{section}"));
    }

    if !ctx.predecessors.is_empty() {
        parts.push("\n## WHAT HAPPENED BEFORE YOU".to_string());
        parts.push(role.predecessors_intro().to_string());
        for summary in ctx.predecessors {
            parts.push(format!("\n---\n{summary}"));
        }
    }

    if let Some(instructions) = role.instructions() {
        parts.push(format!("\n{instructions}"));
    }

    if role.includes_requirements() {
        parts.push(format!("\n## Deployment Target: {}", spec.deployment.target));
    }

    push_skills(&mut parts, spec, SkillCategory::Feature, "Detailed Feature Instructions");
    push_skills(&mut parts, spec, SkillCategory::Style, "Detailed Style Instructions");

    let on_complete: Vec<_> = spec.rules_for(RuleTrigger::OnTaskComplete).collect();
    if !on_complete.is_empty() {
        parts.push("\n## Validation Rules".to_string());
        for r in on_complete {
            parts.push(format!("### {}\n{}", r.name, r.prompt));
        }
    }

    let mut prompt = parts.join("\n");
    if !ctx.manifest.is_empty() {
        prompt.push_str("\n\n## FILES IN WORKSPACE\n");
        prompt.push_str(ctx.manifest);
    }
    prompt
}

fn push_skills(parts: &mut Vec<String>, spec: &ProjectSpec, category: SkillCategory, title: &str) {
    let skills: Vec<_> = spec.skills_in(category).collect();
    if skills.is_empty() {
        return;
    }
    parts.push(format!("\n## {title}"));
    for s in skills {
        parts.push(format!("### {}\n{}", s.name, s.prompt));
    }
}

/// Section appended to the user prompt on each retry, built from the
/// `on_test_fail` rules. `None` when there are no such rules.
pub fn retry_section(spec: &ProjectSpec) -> Option<String> {
    let rules: Vec<_> = spec.rules_for(RuleTrigger::OnTestFail).collect();
    if rules.is_empty() {
        return None;
    }
    let mut section = String::from("\n\n## Retry Rules\n");
    for r in rules {
        section.push_str(&format!("### {}\n{}\n", r.name, r.prompt));
    }
    Some(section)
}
