use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use kn_core::config::TestsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TestRunError {
    #[error("failed to launch test command {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub test_name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub tests: Vec<TestCase>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub coverage_pct: Option<f64>,
}

impl TestReport {
    pub fn from_cases(tests: Vec<TestCase>, coverage_pct: Option<f64>) -> Self {
        let passed = tests.iter().filter(|t| t.passed).count();
        Self {
            total: tests.len(),
            failed: tests.len() - passed,
            passed,
            tests,
            coverage_pct,
        }
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, project: &Path) -> Result<TestReport, TestRunError>;
}

// ---------------------------------------------------------------------------
// PytestRunner
// ---------------------------------------------------------------------------

/// Runs pytest in verbose mode and parses its per-test lines and the
/// `TOTAL` coverage row.
#[derive(Debug, Clone)]
pub struct PytestRunner {
    command: String,
    args: Vec<String>,
}

impl PytestRunner {
    pub fn new(config: &TestsConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

impl Default for PytestRunner {
    fn default() -> Self {
        Self::new(&TestsConfig::default())
    }
}

#[async_trait]
impl TestRunner for PytestRunner {
    async fn run_tests(&self, project: &Path) -> Result<TestReport, TestRunError> {
        if !project.join("tests").is_dir() {
            return Ok(TestReport::default());
        }

        let output = Command::new(&self.command)
            .args(&self.args)
            .current_dir(project)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TestRunError::Launch {
                command: self.command.clone(),
                source,
            })?;

        // pytest exits non-zero when tests fail; the output is still the report.
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_pytest_output(&stdout))
    }
}

fn case_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<name>\S+::\S+)\s+(?P<outcome>PASSED|FAILED|ERROR)\b").expect("valid regex")
    })
}

fn coverage_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^TOTAL\s.*?(?P<pct>\d+(?:\.\d+)?)%\s*$").expect("valid regex"))
}

pub fn parse_pytest_output(stdout: &str) -> TestReport {
    let mut cases = Vec::new();
    let mut coverage = None;

    for line in stdout.lines() {
        let line = line.trim_end();
        if let Some(caps) = case_line().captures(line) {
            let outcome = &caps["outcome"];
            cases.push(TestCase {
                test_name: caps["name"].to_string(),
                passed: outcome == "PASSED",
                details: outcome.to_string(),
            });
        } else if let Some(caps) = coverage_line().captures(line) {
            coverage = caps["pct"].parse::<f64>().ok();
        }
    }

    TestReport::from_cases(cases, coverage)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
============================= test session starts ==============================
collected 3 items

tests/test_game.py::test_score_starts_at_zero PASSED                     [ 33%]
tests/test_game.py::test_snake_moves PASSED                              [ 66%]
tests/test_game.py::test_wall_collision FAILED                           [100%]

---------- coverage: platform linux, python 3.12.1-final-0 -----------
Name              Stmts   Miss  Cover
-------------------------------------
src/game.py          40     10    75%
-------------------------------------
TOTAL                40     10    75%
";

    #[test]
    fn parses_cases_and_coverage() {
        let report = parse_pytest_output(SAMPLE);
        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.coverage_pct, Some(75.0));
        assert_eq!(report.tests[2].test_name, "tests/test_game.py::test_wall_collision");
        assert!(!report.tests[2].passed);
    }

    #[test]
    fn output_without_tests_is_empty() {
        let report = parse_pytest_output("no tests ran in 0.01s\n");
        assert_eq!(report, TestReport::default());
    }

    #[tokio::test]
    async fn missing_tests_dir_yields_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = PytestRunner::default().run_tests(dir.path()).await.unwrap();
        assert_eq!(report.total, 0);
        assert!(report.coverage_pct.is_none());
    }
}
