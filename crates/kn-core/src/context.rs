//! Context handed forward from finished tasks to the ones that follow.
//!
//! Everything here is a pure function of its inputs apart from
//! [`build_file_manifest`], which reads the workspace tree.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::types::{Agent, AgentRole, AgentStatus, Task, TaskStatus};

pub const TRUNCATION_MARKER: &str = " [truncated]";
const HINT_MAX_CHARS: usize = 80;
/// Bytes read from a file when looking for its first line.
const HINT_READ_LIMIT: u64 = 4096;

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Truncate `text` to at most `max_words` whitespace-separated words.
///
/// Text that already fits is returned unchanged, so capping twice is the same
/// as capping once.
pub fn cap_summary(text: &str, max_words: usize) -> String {
    if let Some(body) = text.strip_suffix(TRUNCATION_MARKER) {
        if body.split_whitespace().count() <= max_words {
            return text.to_string();
        }
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return text.to_string();
    }
    let mut capped = words[..max_words].join(" ");
    capped.push_str(TRUNCATION_MARKER);
    capped
}

// ---------------------------------------------------------------------------
// File manifest
// ---------------------------------------------------------------------------

/// List files under `dir` as `relative/path  # first line` entries.
///
/// Directories named in `excluded` are skipped entirely. At most
/// `max_entries` files are listed; the remainder is reported as a single
/// `(and N more...)` line. Returns an empty string for a missing or empty
/// directory.
pub fn build_file_manifest(dir: &Path, max_entries: usize, excluded: &[String]) -> String {
    if !dir.is_dir() {
        return String::new();
    }

    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() > 0
                && e.file_type().is_dir()
                && excluded.iter().any(|x| e.file_name() == x.as_str()))
        });

    let mut files: Vec<String> = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if files.len() < max_entries {
            lines.push(match first_line_hint(entry.path()) {
                Some(hint) => format!("{rel}  # {hint}"),
                None => rel.clone(),
            });
        }
        files.push(rel);
    }

    if files.len() > max_entries {
        lines.push(format!("(and {} more...)", files.len() - max_entries));
    }
    lines.join("\n")
}

fn first_line_hint(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut line = String::new();
    BufReader::new(file.take(HINT_READ_LIMIT))
        .read_line(&mut line)
        .ok()?;
    let hint = line.trim();
    if hint.is_empty() {
        return None;
    }
    Some(hint.chars().take(HINT_MAX_CHARS).collect())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Every task reachable backwards from `task_id` through dependency edges.
///
/// Each ancestor appears once. A visited set guards against cycles, so a task
/// on a cycle may appear among its own predecessors.
pub fn transitive_predecessors(task_id: &str, tasks: &HashMap<String, Task>) -> Vec<String> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut ordered: Vec<String> = Vec::new();
    let mut stack: Vec<String> = tasks
        .get(task_id)
        .map(|t| t.dependencies.clone())
        .unwrap_or_default();

    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(task) = tasks.get(&current) {
            stack.extend(task.dependencies.iter().cloned());
        }
        ordered.push(current);
    }
    ordered
}

/// Render the shared `project_context.md` document from completed summaries,
/// ordered by task id.
pub fn build_project_context(
    summaries: &HashMap<String, String>,
    completed: &HashSet<String>,
) -> String {
    let mut ids: Vec<&String> = completed
        .iter()
        .filter(|id| summaries.contains_key(*id))
        .collect();
    ids.sort();

    let mut out = String::from("# Project Context\n\n");
    for id in ids {
        out.push_str(&format!("## {}\n{}\n\n", id, summaries[id]));
    }
    out
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub status: TaskStatus,
    pub agent_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub role: AgentRole,
    pub status: AgentStatus,
}

/// Contents of `current_state.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentState {
    pub tasks: BTreeMap<String, TaskSnapshot>,
    pub agents: BTreeMap<String, AgentSnapshot>,
}

pub fn build_current_state(tasks: &[Task], agents: &[Agent]) -> CurrentState {
    CurrentState {
        tasks: tasks
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    TaskSnapshot {
                        name: t.name.clone(),
                        status: t.status,
                        agent_name: t.agent_name.clone(),
                    },
                )
            })
            .collect(),
        agents: agents
            .iter()
            .map(|a| {
                (
                    a.name.clone(),
                    AgentSnapshot {
                        role: a.role,
                        status: a.status,
                    },
                )
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excluded() -> Vec<String> {
        vec![".kiln".into(), ".git".into(), "__pycache__".into()]
    }

    fn task_map(edges: Vec<(&str, Vec<&str>)>) -> HashMap<String, Task> {
        edges
            .into_iter()
            .map(|(id, deps)| (id.to_string(), Task::new(id, id).with_dependencies(deps)))
            .collect()
    }

    #[test]
    fn cap_leaves_short_text_alone() {
        assert_eq!(cap_summary("one two three", 3), "one two three");
        assert_eq!(cap_summary("  spaced\n out  ", 2), "  spaced\n out  ");
        assert_eq!(cap_summary("", 5), "");
    }

    #[test]
    fn cap_truncates_one_word_over() {
        let capped = cap_summary("one two three four", 3);
        assert_eq!(capped, "one two three [truncated]");
        assert_eq!(capped.matches("[truncated]").count(), 1);
    }

    #[test]
    fn cap_is_idempotent() {
        let text = (0..700).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let once = cap_summary(&text, 500);
        assert!(once.ends_with(" [truncated]"));
        assert_eq!(once.split_whitespace().count(), 501);
        assert_eq!(cap_summary(&once, 500), once);
    }

    #[test]
    fn project_context_only_lists_completed() {
        let summaries: HashMap<String, String> = [
            ("t2".to_string(), "second".to_string()),
            ("t1".to_string(), "first".to_string()),
            ("t3".to_string(), "third".to_string()),
        ]
        .into_iter()
        .collect();
        let completed: HashSet<String> = ["t2".to_string(), "t1".to_string(), "t9".to_string()]
            .into_iter()
            .collect();

        let ctx = build_project_context(&summaries, &completed);
        assert!(ctx.starts_with("# Project Context\n\n"));
        let t1 = ctx.find("## t1").unwrap();
        let t2 = ctx.find("## t2").unwrap();
        assert!(t1 < t2);
        assert!(!ctx.contains("## t3"));
        assert!(!ctx.contains("## t9"));
    }

    #[test]
    fn predecessors_are_transitive_and_unique() {
        let tasks = task_map(vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["a"]),
            ("d", vec!["b", "c"]),
        ]);
        let mut preds = transitive_predecessors("d", &tasks);
        preds.sort();
        assert_eq!(preds, vec!["a", "b", "c"]);
        assert!(transitive_predecessors("a", &tasks).is_empty());
        assert!(transitive_predecessors("missing", &tasks).is_empty());
    }

    #[test]
    fn predecessors_terminate_on_cycle() {
        let tasks = task_map(vec![("a", vec!["b"]), ("b", vec!["a"])]);
        let mut preds = transitive_predecessors("a", &tasks);
        preds.sort();
        assert_eq!(preds, vec!["a", "b"]);
    }

    #[test]
    fn manifest_lists_files_with_hints() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".kiln/comms")).unwrap();
        std::fs::write(dir.path().join("src/main.py"), "# entry point\nprint(1)\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        std::fs::write(dir.path().join(".kiln/comms/t1_summary.md"), "hidden").unwrap();

        let manifest = build_file_manifest(dir.path(), 200, &excluded());
        assert_eq!(manifest, "README.md\nsrc/main.py  # # entry point");
    }

    #[test]
    fn manifest_hint_is_capped_at_80_chars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("long.txt"), "x".repeat(200)).unwrap();
        let manifest = build_file_manifest(dir.path(), 200, &excluded());
        assert_eq!(manifest, format!("long.txt  # {}", "x".repeat(80)));
    }

    #[test]
    fn manifest_hint_reads_only_the_head_of_large_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), vec![0xFFu8; 1 << 20]).unwrap();
        std::fs::write(dir.path().join("wide.txt"), "y".repeat(10_000)).unwrap();
        let manifest = build_file_manifest(dir.path(), 200, &excluded());
        assert_eq!(
            manifest,
            format!("blob.bin\nwide.txt  # {}", "y".repeat(80))
        );
    }

    #[test]
    fn manifest_reports_overflow() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "").unwrap();
        }
        let manifest = build_file_manifest(dir.path(), 3, &excluded());
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines, vec!["f0.txt", "f1.txt", "f2.txt", "(and 2 more...)"]);
    }

    #[test]
    fn manifest_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(build_file_manifest(&dir.path().join("nope"), 200, &excluded()), "");
    }

    #[test]
    fn current_state_shape() {
        let mut task = Task::new("t1", "Build it").with_agent("Sparky");
        task.status = TaskStatus::Done;
        let agent = Agent::new("Sparky", AgentRole::Builder);

        let state = build_current_state(&[task], &[agent]);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["tasks"]["t1"]["status"], "done");
        assert_eq!(json["tasks"]["t1"]["agent_name"], "Sparky");
        assert_eq!(json["agents"]["Sparky"]["role"], "builder");
        assert_eq!(json["agents"]["Sparky"]["status"], "idle");
    }
}
