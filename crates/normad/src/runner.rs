//! Subprocess Runner (C5): invokes an agent command for one role, feeding it
//! the Role Contract request on stdin and capturing its stdout/stderr to the
//! step directory.

use norma_core::Role;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent command for role {0} not found")]
    CommandNotFound(Role),
    #[error("agent timed out after {0} seconds")]
    Timeout(u32),
    #[error("pty error: {0}")]
    Pty(String),
    #[error("agent invocation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Raw outcome of one agent invocation, before response validation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// How the subprocess's terminal is modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// Plain piped stdin/stdout/stderr (the default).
    Piped,
    /// Allocate a pseudo-terminal, for agent commands that behave
    /// differently when not attached to a tty. The request is still written
    /// to the pty's input side, terminated with an EOT (0x04) byte.
    Pty,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub command: String,
    pub timeout_sec: u32,
    pub terminal_mode: TerminalMode,
    /// Additionally mirror stdout/stderr to this process's terminal
    /// (Section 4.5): only when the operator turned on `debug` config.
    pub debug: bool,
}

/// Writes `input.json` + `stdout.log`/`stderr.log` under `step_dir` and runs
/// `command` with the request piped on stdin.
pub struct Runner;

impl Runner {
    pub fn input_path(step_dir: &Path) -> PathBuf {
        step_dir.join("input.json")
    }

    pub fn stdout_path(step_dir: &Path) -> PathBuf {
        step_dir.join("logs/stdout.txt")
    }

    pub fn stderr_path(step_dir: &Path) -> PathBuf {
        step_dir.join("logs/stderr.txt")
    }

    /// Run one agent invocation for `config.command`, feeding it `request_json`
    /// on stdin and persisting input/output artifacts under `step_dir`.
    ///
    /// If `cancel` fires before the agent exits, the child process is killed
    /// and [`RunnerError::Cancelled`] is returned promptly rather than
    /// waiting for the agent to finish on its own.
    pub async fn run(
        config: &RunnerConfig,
        role: Role,
        step_dir: &Path,
        working_dir: &Path,
        request_json: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        std::fs::create_dir_all(step_dir.join("logs"))?;
        std::fs::write(Self::input_path(step_dir), request_json)?;

        let start = std::time::Instant::now();
        let outcome = match config.terminal_mode {
            TerminalMode::Piped => Self::run_piped(config, role, working_dir, request_json, cancel).await,
            TerminalMode::Pty => Self::run_pty(config, role, working_dir, request_json).await,
        }?;
        let duration_ms = start.elapsed().as_millis() as u64;

        std::fs::write(Self::stdout_path(step_dir), &outcome.0)?;
        std::fs::write(Self::stderr_path(step_dir), &outcome.1)?;

        if config.debug {
            use std::io::Write as _;
            std::io::stdout().write_all(&outcome.0).ok();
            std::io::stderr().write_all(&outcome.1).ok();
        }

        Ok(RunOutcome {
            stdout: outcome.0,
            stderr: outcome.1,
            exit_code: outcome.2,
            duration_ms,
        })
    }

    async fn run_piped(
        config: &RunnerConfig,
        role: Role,
        working_dir: &Path,
        request_json: &str,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        debug!(role = %role, command = %config.command, "spawning agent subprocess");

        let mut child = Command::new(&config.command)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RunnerError::CommandNotFound(role)
                } else {
                    RunnerError::Io(e)
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request_json.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        if cancel.is_cancelled() {
            child.start_kill().ok();
            child.wait().await.ok();
            return Err(RunnerError::Cancelled);
        }

        let wait = child.wait_with_output();
        let wait_or_timeout = async {
            if config.timeout_sec > 0 {
                match timeout(Duration::from_secs(config.timeout_sec as u64), wait).await {
                    Ok(result) => result.map_err(RunnerError::from),
                    Err(_) => Err(RunnerError::Timeout(config.timeout_sec)),
                }
            } else {
                wait.await.map_err(RunnerError::from)
            }
        };

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                warn!(role = %role, "agent invocation cancelled, terminating subprocess");
                return Err(RunnerError::Cancelled);
            }
            result = wait_or_timeout => {
                match result {
                    Ok(output) => output,
                    Err(RunnerError::Timeout(secs)) => {
                        warn!(role = %role, timeout_sec = secs, "agent invocation timed out");
                        return Err(RunnerError::Timeout(secs));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        Ok((output.stdout, output.stderr, output.status.code().unwrap_or(-1)))
    }

    /// PTY-backed invocation for agent commands whose behavior depends on a
    /// tty. Runs the blocking `portable_pty` session on a dedicated thread
    /// since the crate's API is synchronous.
    async fn run_pty(
        config: &RunnerConfig,
        role: Role,
        working_dir: &Path,
        request_json: &str,
    ) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        let command = config.command.clone();
        let working_dir = working_dir.to_path_buf();
        let request_json = request_json.to_string();
        let timeout_sec = config.timeout_sec;

        let join = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, Vec<u8>, i32)> {
            use portable_pty::{native_pty_system, CommandBuilder, PtySize};

            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize {
                    rows: 40,
                    cols: 120,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| RunnerError::Pty(e.to_string()))?;

            let mut cmd = CommandBuilder::new(&command);
            cmd.cwd(&working_dir);

            let mut child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| RunnerError::Pty(e.to_string()))?;
            drop(pair.slave);

            let mut writer = pair
                .master
                .take_writer()
                .map_err(|e| RunnerError::Pty(e.to_string()))?;
            writer
                .write_all(request_json.as_bytes())
                .map_err(RunnerError::Io)?;
            // 0x04 (EOT) signals end-of-input to a PTY-attached reader, since
            // a pty has no native stdin-close analogue.
            writer.write_all(&[0x04]).map_err(RunnerError::Io)?;

            let mut reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| RunnerError::Pty(e.to_string()))?;
            let mut stdout = Vec::new();
            std::io::Read::read_to_end(&mut reader, &mut stdout).ok();

            let exit_code = if timeout_sec > 0 {
                child
                    .wait()
                    .map_err(RunnerError::Io)?
                    .exit_code() as i32
            } else {
                child.wait().map_err(RunnerError::Io)?.exit_code() as i32
            };

            Ok((stdout, Vec::new(), exit_code))
        });

        join.await.map_err(|e| RunnerError::Pty(e.to_string()))?
    }
}
