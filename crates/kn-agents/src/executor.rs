use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use kn_core::config::ExecutorConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error talking to agent process: {0}")]
    Io(#[from] std::io::Error),
    #[error("task execution timed out after {0}s")]
    Timeout(u64),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::Spawn { source, .. } => {
                source.kind() != std::io::ErrorKind::NotFound
                    && source.kind() != std::io::ErrorKind::PermissionDenied
            }
            ExecutorError::Io(_) | ExecutorError::Timeout(_) => true,
            ExecutorError::Internal(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub prompt: String,
    pub system_prompt: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// What the agent reports it did; the failure reason when unsuccessful.
    pub summary: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl ExecutionResult {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            ..Self::default()
        }
    }
}

/// Receives streamed agent output, one chunk at a time.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

/// Performs the actual work of a task. The pipeline bounds each call with a
/// timeout and treats errors as failed attempts.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest, output: OutputSink)
        -> Result<ExecutionResult>;
}

// ---------------------------------------------------------------------------
// CliExecutor
// ---------------------------------------------------------------------------

/// Runs a coding-agent CLI in the task's workspace.
///
/// The user prompt is written to stdin. `{system_prompt}` and `{task_id}` in
/// the configured arguments are substituted per call. Each stdout line is
/// forwarded to the output sink. A final stdout line that is a JSON object
/// with a `result` field is read as a structured report carrying the summary
/// and token usage.
#[derive(Debug, Clone)]
pub struct CliExecutor {
    command: String,
    args: Vec<String>,
}

impl CliExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn render_args(&self, request: &ExecutionRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{system_prompt}", &request.system_prompt)
                    .replace("{task_id}", &request.task_id)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct StructuredReport {
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: ReportUsage,
    #[serde(default)]
    total_cost_usd: f64,
}

#[derive(Debug, Default, Deserialize)]
struct ReportUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Build a result from the collected stdout lines and exit status.
fn interpret_output(lines: &[String], exit_ok: bool, stderr: &str) -> ExecutionResult {
    if let Some(last) = lines.iter().rev().find(|l| !l.trim().is_empty()) {
        if let Ok(report) = serde_json::from_str::<StructuredReport>(last.trim()) {
            return ExecutionResult {
                success: exit_ok && !report.is_error,
                summary: report.result,
                input_tokens: report.usage.input_tokens,
                output_tokens: report.usage.output_tokens,
                cost_usd: report.total_cost_usd,
            };
        }
    }

    let stdout = lines.join("\n").trim().to_string();
    if exit_ok {
        ExecutionResult::succeeded(stdout)
    } else if !stderr.trim().is_empty() {
        ExecutionResult::failed(stderr.trim())
    } else if !stdout.is_empty() {
        ExecutionResult::failed(stdout)
    } else {
        ExecutionResult::failed("Agent exited with an error")
    }
}

#[async_trait]
impl TaskExecutor for CliExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        output: OutputSink,
    ) -> Result<ExecutionResult> {
        let mut child = Command::new(&self.command)
            .args(self.render_args(&request))
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        debug!(task_id = %request.task_id, command = %self.command, "agent process started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::Internal("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Internal("stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::Internal("stderr not captured".into()))?;

        let prompt = request.prompt.clone();
        let writer = tokio::spawn(async move {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await
        });
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Some(line) = reader.next_line().await? {
            output(&line);
            lines.push(line);
        }

        let status = child.wait().await?;
        // A broken pipe here just means the agent stopped reading early.
        let _ = writer.await;
        let stderr = stderr_reader.await.unwrap_or_default();

        debug!(task_id = %request.task_id, ?status, "agent process exited");
        Ok(interpret_output(&lines, status.success(), &stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_output_becomes_summary() {
        let result = interpret_output(&lines(&["Created src/app.py", "Done."]), true, "");
        assert!(result.success);
        assert_eq!(result.summary, "Created src/app.py\nDone.");
        assert_eq!(result.input_tokens, 0);
    }

    #[test]
    fn structured_report_is_parsed() {
        let report = r#"{"type":"result","result":"Built the board","is_error":false,"usage":{"input_tokens":1200,"output_tokens":340},"total_cost_usd":0.02}"#;
        let result = interpret_output(&lines(&["working...", report]), true, "");
        assert!(result.success);
        assert_eq!(result.summary, "Built the board");
        assert_eq!(result.input_tokens, 1200);
        assert_eq!(result.output_tokens, 340);
        assert!((result.cost_usd - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn failure_prefers_stderr() {
        let result = interpret_output(&lines(&["partial"]), false, "boom\n");
        assert!(!result.success);
        assert_eq!(result.summary, "boom");

        let result = interpret_output(&[], false, "");
        assert_eq!(result.summary, "Agent exited with an error");
    }

    #[test]
    fn missing_binary_is_not_retryable() {
        let err = ExecutorError::Spawn {
            command: "nope".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!err.is_retryable());
        assert!(ExecutorError::Timeout(5).is_retryable());
    }

    #[test]
    fn args_are_substituted() {
        let exec = CliExecutor::new(&ExecutorConfig {
            command: "agent".into(),
            args: vec!["--system".into(), "{system_prompt}".into(), "--id={task_id}".into()],
            timeout_secs: 10,
        });
        let request = ExecutionRequest {
            task_id: "t1".into(),
            prompt: "do it".into(),
            system_prompt: "be nice".into(),
            working_dir: PathBuf::from("."),
        };
        assert_eq!(exec.render_args(&request), vec!["--system", "be nice", "--id=t1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_a_real_process() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CliExecutor::new(&ExecutorConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "cat; echo; echo finished {task_id}".into()],
            timeout_secs: 10,
        });
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: OutputSink = Arc::new(move |line: &str| {
            sink_seen.lock().unwrap().push(line.to_string());
        });

        let result = exec
            .execute(
                ExecutionRequest {
                    task_id: "t9".into(),
                    prompt: "hello agent".into(),
                    system_prompt: String::new(),
                    working_dir: dir.path().to_path_buf(),
                },
                sink,
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.summary.contains("hello agent"));
        assert!(result.summary.ends_with("finished t9"));
        assert!(seen.lock().unwrap().iter().any(|l| l == "finished t9"));
    }
}
