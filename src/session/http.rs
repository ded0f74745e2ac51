//! HTTP session driver.
//!
//! Each session identity is a base URL. A task is submitted as
//! `POST <endpoint>` with a JSON body `{"id": ..., "prompt": ...}` and the
//! response is classified by status code:
//!
//! - 2xx: success; the text is taken from a `text`, `response` or `value`
//!   field of a JSON object, a bare JSON string, or the raw body
//! - 429: the identity is exhausted
//! - 401/403: the session is unusable
//! - anything else, and transport errors: recoverable failure

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{SessionDriver, SessionIdentity, TaskOutcome};
use crate::error::SessionError;
use crate::scheduler::Task;

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Response fields checked, in order, for the result text.
const TEXT_FIELDS: [&str; 3] = ["text", "response", "value"];

/// Longest error body echoed into a failure reason.
const MAX_REASON_LEN: usize = 200;

/// Driver that submits tasks to an HTTP endpoint per identity.
#[derive(Debug, Clone)]
pub struct HttpDriver {
    request_timeout: Duration,
    api_key: Option<String>,
}

/// Session state for [`HttpDriver`].
pub struct HttpSession {
    client: Client,
    identity: SessionIdentity,
}

impl HttpSession {
    /// Returns the identity this session is bound to.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    id: &'a str,
    prompt: &'a str,
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDriver {
    /// Creates a driver with the default timeout and no authentication.
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            api_key: None,
        }
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets a bearer token sent with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Maps an HTTP status and body to an outcome.
fn classify_response(status: u16, body: &str) -> Result<TaskOutcome, SessionError> {
    match status {
        200..=299 => match extract_text(body) {
            Some(text) => Ok(TaskOutcome::Success(text)),
            None => Ok(TaskOutcome::RecoverableFailure(
                "empty response body".to_string(),
            )),
        },
        429 => Ok(TaskOutcome::ResourceExhausted),
        401 | 403 => Err(SessionError::Fatal(format!(
            "HTTP {}: {}",
            status,
            truncate(body.trim())
        ))),
        _ => Ok(TaskOutcome::RecoverableFailure(format!(
            "HTTP {}: {}",
            status,
            truncate(body.trim())
        ))),
    }
}

/// Pulls the result text out of a response body.
fn extract_text(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let text = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(serde_json::Value::Object(map)) => TEXT_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_string()),
        _ => trimmed.to_string(),
    };

    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(MAX_REASON_LEN) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl SessionDriver for HttpDriver {
    type Handle = HttpSession;

    async fn initialize(&self, identity: &SessionIdentity) -> Result<HttpSession, SessionError> {
        if !identity.endpoint.starts_with("http://") && !identity.endpoint.starts_with("https://") {
            return Err(SessionError::Unavailable(format!(
                "identity {} is not an http(s) URL",
                identity
            )));
        }

        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| SessionError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpSession {
            client,
            identity: identity.clone(),
        })
    }

    async fn process(
        &self,
        task: &Task,
        session: &mut HttpSession,
    ) -> Result<TaskOutcome, SessionError> {
        let mut request = session
            .client
            .post(&session.identity.endpoint)
            .json(&SubmitRequest {
                id: &task.id,
                prompt: &task.text,
            });
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(TaskOutcome::RecoverableFailure(format!(
                    "request failed: {}",
                    e
                )))
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Ok(TaskOutcome::RecoverableFailure(format!(
                    "failed to read response: {}",
                    e
                )))
            }
        };

        debug!(task_id = %task.id, status = status, "HTTP session responded");
        classify_response(status, &body)
    }

    async fn shutdown(&self, session: HttpSession) {
        debug!(identity = %session.identity, "HTTP session closed");
    }
}
