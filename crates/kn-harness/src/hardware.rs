//! ESP32 / MicroPython deployment: compile check, flash, board detection and
//! a serial line monitor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use kn_core::config::HardwareConfig;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("{tool} not found. Install it and make sure it is on PATH")]
    ToolMissing { tool: String },
    #[error("timed out after {0} seconds")]
    Timeout(u64),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HardwareError>;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub port: String,
    pub board_type: String,
}

/// Receives each non-empty line read from a board.
pub type LineSink = Arc<dyn Fn(String) + Send + Sync>;

/// A running serial monitor. Aborted on [`cancel`](MonitorHandle::cancel)
/// or when dropped.
#[derive(Debug)]
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the monitor ends on its own or is cancelled.
    pub async fn wait(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Hardware: Send + Sync {
    async fn compile(&self, project: &Path) -> Result<CompileResult>;

    /// Flash to `port`, or to the first detected board when `None`.
    async fn flash(&self, project: &Path, port: Option<&str>) -> Result<FlashResult>;

    async fn detect_board(&self) -> Result<Option<BoardInfo>>;

    async fn start_monitor(&self, port: &str, sink: LineSink) -> Result<MonitorHandle>;
}

/// USB VID:PID pairs of the serial bridges found on supported boards.
pub const KNOWN_BOARDS: &[(u16, u16, &str)] = &[
    (0x10c4, 0xea60, "Heltec WiFi LoRa 32 V3 (CP210x)"),
    (0x303a, 0x1001, "ESP32-S3 Native USB"),
    (0x1a86, 0x55d4, "ESP32 (CH9102)"),
];

pub fn board_name(vid: u16, pid: u16) -> Option<&'static str> {
    KNOWN_BOARDS
        .iter()
        .find(|(v, p, _)| *v == vid && *p == pid)
        .map(|(_, _, name)| *name)
}

/// Pick the first known board from `mpremote devs` output. Each line reads
/// `<port> <serial> <vid>:<pid> <manufacturer> <product>`.
pub fn parse_device_list(output: &str) -> Option<BoardInfo> {
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(port) = fields.next() else {
            continue;
        };
        for field in fields {
            let Some((vid, pid)) = field.split_once(':') else {
                continue;
            };
            let (Ok(vid), Ok(pid)) = (u16::from_str_radix(vid, 16), u16::from_str_radix(pid, 16))
            else {
                continue;
            };
            if let Some(name) = board_name(vid, pid) {
                return Some(BoardInfo {
                    port: port.to_string(),
                    board_type: name.to_string(),
                });
            }
        }
    }
    None
}

/// Python sources under `project`, skipping hidden directories and
/// `__pycache__`. Sorted by path.
pub fn python_sources(project: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(project)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !(name.starts_with('.') || name == "__pycache__")
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "py"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

// ---------------------------------------------------------------------------
// MpremoteHardware
// ---------------------------------------------------------------------------

/// [`Hardware`] backed by `python3 -m py_compile` and `mpremote`.
#[derive(Debug, Clone)]
pub struct MpremoteHardware {
    python: String,
    mpremote: String,
    flash_timeout: Duration,
}

impl MpremoteHardware {
    pub fn new(config: &HardwareConfig) -> Self {
        Self {
            python: config.python.clone(),
            mpremote: config.mpremote.clone(),
            flash_timeout: Duration::from_secs(config.flash_timeout_secs),
        }
    }

    fn missing(tool: &str, e: std::io::Error) -> HardwareError {
        if e.kind() == std::io::ErrorKind::NotFound {
            HardwareError::ToolMissing {
                tool: tool.to_string(),
            }
        } else {
            HardwareError::Io(e)
        }
    }
}

impl Default for MpremoteHardware {
    fn default() -> Self {
        Self::new(&HardwareConfig::default())
    }
}

#[async_trait]
impl Hardware for MpremoteHardware {
    async fn compile(&self, project: &Path) -> Result<CompileResult> {
        let sources = python_sources(project);
        if sources.is_empty() {
            return Ok(CompileResult {
                success: false,
                errors: vec!["No Python files found".into()],
                output_path: project.to_path_buf(),
            });
        }

        let mut errors = Vec::new();
        for file in &sources {
            let output = Command::new(&self.python)
                .args(["-m", "py_compile"])
                .arg(file)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| Self::missing(&self.python, e))?;
            if !output.status.success() {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let stderr = String::from_utf8_lossy(&output.stderr);
                errors.push(format!("{name}: {}", stderr.trim()));
            }
        }

        Ok(CompileResult {
            success: errors.is_empty(),
            errors,
            output_path: project.to_path_buf(),
        })
    }

    async fn flash(&self, project: &Path, port: Option<&str>) -> Result<FlashResult> {
        let port = match port {
            Some(p) => p.to_string(),
            None => match self.detect_board().await? {
                Some(board) => board.port,
                None => {
                    return Ok(FlashResult {
                        success: false,
                        message: "No ESP32 board detected. Connect your board via USB and try again."
                            .into(),
                    })
                }
            },
        };

        let sources = python_sources(project);
        if sources.is_empty() {
            return Ok(FlashResult {
                success: false,
                message: "No Python files to flash".into(),
            });
        }

        let mut cmd = Command::new(&self.mpremote);
        cmd.args(["connect", port.as_str(), "cp"]);
        for file in &sources {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            cmd.arg(file).arg(format!(":/{name}"));
        }
        let main_py = project.join("main.py");
        if main_py.is_file() {
            cmd.args(["+", "run"]).arg(&main_py);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(port = %port, files = sources.len(), "flashing");
        let child = cmd.spawn().map_err(|e| Self::missing(&self.mpremote, e))?;
        let output = tokio::time::timeout(self.flash_timeout, child.wait_with_output())
            .await
            .map_err(|_| HardwareError::Timeout(self.flash_timeout.as_secs()))??;

        if output.status.success() {
            Ok(FlashResult {
                success: true,
                message: format!("Flashed {} file(s) to {}", sources.len(), port),
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            Ok(FlashResult {
                success: false,
                message: format!(
                    "Flash failed: {}",
                    if stderr.is_empty() { "Unknown error" } else { stderr }
                ),
            })
        }
    }

    async fn detect_board(&self) -> Result<Option<BoardInfo>> {
        let output = match Command::new(&self.mpremote)
            .arg("devs")
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(tool = %self.mpremote, "not installed, cannot detect boards");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(parse_device_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn start_monitor(&self, port: &str, sink: LineSink) -> Result<MonitorHandle> {
        let mut cmd = Command::new(&self.mpremote);
        cmd.args(["connect", port, "resume"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let port = port.to_string();

        let task = tokio::spawn(async move {
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    sink(format!("[Error] Could not open {port}: {e}"));
                    return;
                }
            };
            let Some(stdout) = child.stdout.take() else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            sink(line.to_string());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        sink(format!("[Error] {e}"));
                        break;
                    }
                }
            }
            let _ = child.wait().await;
        });

        Ok(MonitorHandle::new(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_board() {
        let output = "/dev/ttyUSB0 0001 10c4:ea60 Silicon Labs CP2102 USB to UART\n";
        let board = parse_device_list(output).unwrap();
        assert_eq!(board.port, "/dev/ttyUSB0");
        assert_eq!(board.board_type, "Heltec WiFi LoRa 32 V3 (CP210x)");
    }

    #[test]
    fn skips_unknown_devices() {
        let output = "/dev/ttyS0 None 0000:0000 None None\n\
                      COM4 abc 303A:1001 Espressif USB JTAG\n";
        let board = parse_device_list(output).unwrap();
        assert_eq!(board.port, "COM4");
        assert_eq!(board.board_type, "ESP32-S3 Native USB");
    }

    #[test]
    fn no_board_in_empty_output() {
        assert!(parse_device_list("").is_none());
        assert!(parse_device_list("/dev/ttyS0 None 0000:0000 None None").is_none());
    }

    #[test]
    fn python_sources_skip_hidden_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join(".kiln")).unwrap();
        std::fs::create_dir_all(root.join("src/__pycache__")).unwrap();
        std::fs::write(root.join("main.py"), "").unwrap();
        std::fs::write(root.join("src/led.py"), "").unwrap();
        std::fs::write(root.join("src/notes.txt"), "").unwrap();
        std::fs::write(root.join(".kiln/hidden.py"), "").unwrap();
        std::fs::write(root.join("src/__pycache__/led.py"), "").unwrap();

        let files: Vec<PathBuf> = python_sources(root)
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(files, vec![PathBuf::from("main.py"), PathBuf::from("src/led.py")]);
    }

    #[tokio::test]
    async fn compile_without_sources_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = MpremoteHardware::default().compile(dir.path()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors, vec!["No Python files found"]);
    }

    #[tokio::test]
    async fn flash_without_sources_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = MpremoteHardware::default()
            .flash(dir.path(), Some("/dev/null"))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "No Python files to flash");
    }
}
