//! Session driver interface.
//!
//! A session driver performs one task against one long-lived external
//! session (a browser tab, an authenticated API client, a subprocess). The
//! core never inspects how a driver works; it only relies on the contract:
//!
//! - `initialize` binds a new session to a [`SessionIdentity`]
//! - `process` runs one task and returns a closed [`TaskOutcome`]
//! - `shutdown` releases the session
//!
//! A session serves one task at a time. Parallelism comes from running
//! several workers, each with its own session.
//!
//! Conditions that make the session itself unusable are reported as
//! [`SessionError`]; everything task-related is a `TaskOutcome` variant.

pub mod command;
pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SessionError;
use crate::scheduler::Task;

pub use command::{CommandDriver, CommandSession};
pub use http::{HttpDriver, HttpSession};

/// An external account or endpoint a cohort of workers is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    /// Position in the configured identity list.
    pub index: usize,
    /// Opaque endpoint handed to the driver (URL, profile name, ...).
    pub endpoint: String,
}

impl SessionIdentity {
    /// Creates a new identity.
    pub fn new(index: usize, endpoint: impl Into<String>) -> Self {
        Self {
            index,
            endpoint: endpoint.into(),
        }
    }

    /// Builds identities from an ordered list of endpoints.
    pub fn from_endpoints<I, S>(endpoints: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        endpoints
            .into_iter()
            .enumerate()
            .map(|(index, endpoint)| Self::new(index, endpoint))
            .collect()
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.index, self.endpoint)
    }
}

/// Classification of a single `process` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The session produced a result text.
    Success(String),
    /// The task failed in a way that may succeed on another attempt.
    RecoverableFailure(String),
    /// The session identity ran out of quota. Not charged to the task.
    ResourceExhausted,
}

impl TaskOutcome {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Success(_) => "success",
            TaskOutcome::RecoverableFailure(_) => "recoverable_failure",
            TaskOutcome::ResourceExhausted => "resource_exhausted",
        }
    }
}

/// Drives tasks through an external interactive session.
#[async_trait]
pub trait SessionDriver: Send + Sync + 'static {
    /// Per-worker session state.
    type Handle: Send + 'static;

    /// Opens a session bound to `identity`.
    async fn initialize(&self, identity: &SessionIdentity) -> Result<Self::Handle, SessionError>;

    /// Runs one task: submit, await completion, extract the result, classify.
    async fn process(
        &self,
        task: &Task,
        session: &mut Self::Handle,
    ) -> Result<TaskOutcome, SessionError>;

    /// Releases the session. Called exactly once per successful `initialize`.
    async fn shutdown(&self, session: Self::Handle);
}
