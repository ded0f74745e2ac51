//! Subprocess session driver.
//!
//! Runs a configured program once per task with the task text on stdin.
//! The session identity is exported to the child so the program can pick
//! the right account/profile/endpoint.
//!
//! # Exit code contract
//!
//! | Exit code | Outcome |
//! |---|---|
//! | `0` with non-empty stdout | `Success(stdout)` |
//! | `exhausted_exit_code` (75, `EX_TEMPFAIL`) | `ResourceExhausted` |
//! | `fatal_exit_code` (78, `EX_CONFIG`) | `SessionError::Fatal` |
//! | anything else | `RecoverableFailure(stderr)` |

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{SessionDriver, SessionIdentity, TaskOutcome};
use crate::error::SessionError;
use crate::scheduler::Task;

/// Default exit code signalling an exhausted identity.
pub const DEFAULT_EXHAUSTED_EXIT_CODE: i32 = 75;

/// Default exit code signalling an unusable session.
pub const DEFAULT_FATAL_EXIT_CODE: i32 = 78;

/// Environment variable carrying the identity endpoint.
pub const ENV_SESSION_IDENTITY: &str = "RELAY_SESSION_IDENTITY";
/// Environment variable carrying the identity index.
pub const ENV_SESSION_INDEX: &str = "RELAY_SESSION_INDEX";
/// Environment variable carrying the task id.
pub const ENV_TASK_ID: &str = "RELAY_TASK_ID";

/// Driver that runs one subprocess per task.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    program: String,
    args: Vec<String>,
    exhausted_exit_code: i32,
    fatal_exit_code: i32,
}

/// Session state for [`CommandDriver`].
#[derive(Debug, Clone)]
pub struct CommandSession {
    identity: SessionIdentity,
    tasks_run: u64,
}

impl CommandSession {
    /// Returns the identity this session is bound to.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Returns how many tasks this session has run.
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run
    }
}

impl CommandDriver {
    /// Creates a driver for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            exhausted_exit_code: DEFAULT_EXHAUSTED_EXIT_CODE,
            fatal_exit_code: DEFAULT_FATAL_EXIT_CODE,
        }
    }

    /// Sets the program arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sets the exit code mapped to `ResourceExhausted`.
    pub fn with_exhausted_exit_code(mut self, code: i32) -> Self {
        self.exhausted_exit_code = code;
        self
    }

    /// Sets the exit code mapped to a fatal session error.
    pub fn with_fatal_exit_code(mut self, code: i32) -> Self {
        self.fatal_exit_code = code;
        self
    }

    /// Returns the program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Maps a finished child process to an outcome.
    fn classify(
        &self,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> Result<TaskOutcome, SessionError> {
        match exit_code {
            Some(0) => {
                let text = stdout.trim();
                if text.is_empty() {
                    Ok(TaskOutcome::RecoverableFailure(
                        "command produced no output".to_string(),
                    ))
                } else {
                    Ok(TaskOutcome::Success(text.to_string()))
                }
            }
            Some(code) if code == self.exhausted_exit_code => Ok(TaskOutcome::ResourceExhausted),
            Some(code) if code == self.fatal_exit_code => Err(SessionError::Fatal(format!(
                "{} exited with {}: {}",
                self.program,
                code,
                stderr.trim()
            ))),
            Some(code) => Ok(TaskOutcome::RecoverableFailure(format!(
                "exit code {}: {}",
                code,
                stderr.trim()
            ))),
            None => Ok(TaskOutcome::RecoverableFailure(
                "command terminated by signal".to_string(),
            )),
        }
    }
}

#[async_trait]
impl SessionDriver for CommandDriver {
    type Handle = CommandSession;

    async fn initialize(&self, identity: &SessionIdentity) -> Result<CommandSession, SessionError> {
        if self.program.trim().is_empty() {
            return Err(SessionError::Unavailable("no program configured".to_string()));
        }
        Ok(CommandSession {
            identity: identity.clone(),
            tasks_run: 0,
        })
    }

    async fn process(
        &self,
        task: &Task,
        session: &mut CommandSession,
    ) -> Result<TaskOutcome, SessionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_SESSION_IDENTITY, &session.identity.endpoint)
            .env(ENV_SESSION_INDEX, session.identity.index.to_string())
            .env(ENV_TASK_ID, &task.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SessionError::Unavailable(format!("failed to spawn {}: {}", self.program, e))
        })?;

        // Stdin is fed while stdout and stderr are drained, so a child that
        // echoes before reading all of its input cannot fill both pipes.
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading stdin is not an error
                // here; its exit code decides the outcome.
                if let Err(e) = stdin.write_all(task.text.as_bytes()).await {
                    debug!(task_id = %task.id, error = %e, "Child closed stdin early");
                }
                stdin.shutdown().await.ok();
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        session.tasks_run += 1;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            task_id = %task.id,
            exit_code = ?output.status.code(),
            "Command finished"
        );

        self.classify(output.status.code(), &stdout, &stderr)
    }

    async fn shutdown(&self, session: CommandSession) {
        debug!(
            identity = %session.identity,
            tasks_run = session.tasks_run,
            "Command session closed"
        );
    }
}
