use std::future::Future;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use kn_agents::executor::CliExecutor;
use kn_agents::orchestrator::Collaborators;
use kn_agents::planner::{AgentPlanner, Planner, StaticPlanner};
use kn_agents::session::PipelineHandle;
use kn_bridge::protocol::PipelineEvent;
use kn_core::config::Config;

use super::load_spec;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub spec: PathBuf,
    pub plan: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    pub json: bool,
}

pub async fn run(config: Config, opts: RunOptions) -> anyhow::Result<()> {
    let spec = load_spec(&opts.spec)?;

    let planner: Arc<dyn Planner> = match (&opts.plan, &spec.plan) {
        (Some(path), _) => Arc::new(StaticPlanner::from_file(path)),
        (None, Some(_)) => Arc::new(StaticPlanner::from_spec()),
        (None, None) => {
            let cwd = std::env::current_dir().context("resolving current directory")?;
            Arc::new(AgentPlanner::new(
                Arc::new(CliExecutor::new(&config.executor)),
                cwd,
            ))
        }
    };
    let collab = Collaborators::from_config(&config, planner);
    let handle = Arc::new(match &opts.workspace {
        Some(dir) => PipelineHandle::with_workspace(config, collab, dir),
        None => PipelineHandle::new(config, collab),
    });

    let rx = handle.subscribe();
    handle.start(spec)?;
    if !opts.json {
        println!("Session {} in {}", handle.id(), handle.workspace().display());
    }

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    let waiter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.wait().await })
    };
    tokio::pin!(waiter);

    let mut answers = stdin_lines();
    let mut fatal: Option<String> = None;
    loop {
        tokio::select! {
            event = rx.recv_async() => {
                let Ok(event) = event else { break };
                show(&event, opts.json)?;
                match &event {
                    PipelineEvent::HumanGate { .. } => {
                        let finished = async { let _ = (&mut waiter).await; };
                        let Some(answer) = gate_answer(&mut answers, finished).await else {
                            break;
                        };
                        let (approved, feedback) = parse_answer(&answer);
                        if let Err(e) = handle.respond_to_gate(approved, feedback) {
                            tracing::warn!(error = %e, "gate answer not delivered");
                        }
                    }
                    PipelineEvent::Error { message, recoverable: false } => {
                        fatal = Some(message.clone());
                    }
                    _ => {}
                }
            }
            _ = &mut waiter => break,
        }
    }
    for event in rx.try_iter() {
        show(&event, opts.json)?;
        if let PipelineEvent::Error {
            message,
            recoverable: false,
        } = &event
        {
            fatal = Some(message.clone());
        }
    }

    match fatal {
        Some(message) => anyhow::bail!(message),
        None => Ok(()),
    }
}

/// Lines from stdin, read on a plain thread so a prompt left unanswered
/// does not hold up runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Wait for the next answer line. `None` when `finished` resolves first,
/// e.g. the session was stopped while the prompt was open. End of input
/// counts as a blank answer.
async fn gate_answer(
    answers: &mut mpsc::UnboundedReceiver<String>,
    finished: impl Future<Output = ()>,
) -> Option<String> {
    tokio::select! {
        biased;
        _ = finished => None,
        line = answers.recv() => Some(line.unwrap_or_default()),
    }
}

/// Read a gate answer: empty or "y"/"yes" approves, anything else is
/// feedback for a revision.
fn parse_answer(answer: &str) -> (bool, Option<String>) {
    let answer = answer.trim();
    match answer.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => (true, None),
        _ => (false, Some(answer.to_string())),
    }
}

fn show(event: &PipelineEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", event.to_json()?);
    } else if let Some(line) = render(event) {
        println!("{line}");
    }
    Ok(())
}

fn render(event: &PipelineEvent) -> Option<String> {
    let line = match event {
        PipelineEvent::PlanningStarted => "Planning...".to_string(),
        PipelineEvent::PlanReady {
            tasks, explanation, ..
        } => format!("Plan ready: {} task(s). {explanation}", tasks.len()),
        PipelineEvent::TaskStarted { task_id, agent_name } => {
            format!("[{task_id}] {agent_name} started")
        }
        PipelineEvent::AgentOutput { .. } => return None,
        PipelineEvent::TaskRetry {
            task_id,
            attempt,
            max_attempts,
            ..
        } => format!("[{task_id}] retrying ({attempt}/{max_attempts})"),
        PipelineEvent::TokenUsage {
            agent_name,
            input_tokens,
            output_tokens,
            cost_usd,
        } => format!("{agent_name}: {input_tokens} in / {output_tokens} out tokens (${cost_usd:.4})"),
        PipelineEvent::AgentMessage { from, content, .. } => format!("{from}: {content}"),
        PipelineEvent::TaskCompleted { task_id, .. } => format!("[{task_id}] done"),
        PipelineEvent::TaskFailed { task_id, error, .. } => format!("[{task_id}] failed: {error}"),
        PipelineEvent::CommitCreated(record) => {
            format!("commit {} {}", record.short_sha, record.message)
        }
        PipelineEvent::HumanGate {
            question, context, ..
        } => format!("\n{question}\n{context}\n(enter to approve, or type feedback) > "),
        PipelineEvent::TestResult {
            test_name, passed, ..
        } => format!("  {} {test_name}", if *passed { "PASS" } else { "FAIL" }),
        PipelineEvent::CoverageUpdate { percentage } => format!("Coverage: {percentage:.1}%"),
        PipelineEvent::DeployStarted { target } => format!("Deploying to {target}"),
        PipelineEvent::DeployProgress { step, progress } => format!("  [{progress:>3}%] {step}"),
        PipelineEvent::SerialData { line, .. } => format!("serial> {line}"),
        PipelineEvent::DeployComplete { target } => format!("Deployed to {target}"),
        PipelineEvent::SessionComplete { summary } => summary.clone(),
        PipelineEvent::Error {
            message,
            recoverable,
        } => {
            if *recoverable {
                format!("warning: {message}")
            } else {
                format!("error: {message}")
            }
        }
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_answer_approves() {
        assert_eq!(parse_answer("\n"), (true, None));
        assert_eq!(parse_answer(" Yes "), (true, None));
    }

    #[test]
    fn other_answers_are_feedback() {
        assert_eq!(
            parse_answer("Make it blue\n"),
            (false, Some("Make it blue".to_string()))
        );
    }

    #[tokio::test]
    async fn gate_answer_takes_the_next_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send("Make it blue".to_string()).unwrap();
        let answer = gate_answer(&mut rx, std::future::pending()).await;
        assert_eq!(answer.as_deref(), Some("Make it blue"));
    }

    #[tokio::test]
    async fn gate_answer_gives_up_when_session_ends() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<String>();
        let answer = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            gate_answer(&mut rx, std::future::ready(())),
        )
        .await
        .expect("prompt stayed blocked");
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn closed_input_approves() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        drop(tx);
        let answer = gate_answer(&mut rx, std::future::pending()).await;
        assert_eq!(answer.as_deref(), Some(""));
        assert_eq!(parse_answer(&answer.unwrap()), (true, None));
    }

    #[test]
    fn agent_output_is_quiet() {
        let event = PipelineEvent::AgentOutput {
            task_id: "t1".into(),
            agent_name: "Sparky".into(),
            content: "thinking".into(),
        };
        assert!(render(&event).is_none());
        let done = PipelineEvent::SessionComplete {
            summary: "Completed 1/1 tasks.".into(),
        };
        assert_eq!(render(&done).as_deref(), Some("Completed 1/1 tasks."));
    }
}
