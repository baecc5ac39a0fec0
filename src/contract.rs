//! Library-level contract surface for the (externally-specified) HTTP
//! layer.
//!
//! The HTTP surface itself — authentication, request validation, webhook
//! posting — is an out-of-scope external collaborator (§1). This module
//! names the plain request/response shapes an external HTTP binding
//! serializes on top of `Scheduler`/`Store` operations, one struct per
//! route in §6, so that binding never has to reinterpret these semantics.

use serde::{Deserialize, Serialize};

use crate::config::Role;

/// `POST /msg` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct MsgRequest {
    pub session: String,
    pub user: String,
    pub content: String,
    pub webhook: Option<String>,
}

/// `POST /msg` response body: `202 {queued, session}`.
#[derive(Debug, Clone, Serialize)]
pub struct MsgResponse {
    pub queued: bool,
    pub session: String,
}

/// The caller's resolved identity and grant, established by the
/// (external) authentication step before `ingest_message` is called.
/// Carried through the in-memory queue per §4.1 step 3
/// (`(message_id, role, allowed_skills)`), never persisted.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user: String,
    pub role: Role,
    pub allowed_skills: Vec<String>,
    /// True iff `user` is whitelisted (directly or via connector alias).
    /// An unknown user still gets `202` but the message is stored
    /// `trusted=0` and never processed.
    pub trusted: bool,
}

/// `POST /sessions` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub session: String,
    pub webhook: Option<String>,
    pub description: Option<String>,
}

/// `POST /sessions` response body.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub session: String,
    pub created: bool,
}

/// `POST /sessions/{s}/cancel` response body.
#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub plan_id: Option<i64>,
}

/// `GET /sessions?all=` response entry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: String,
    pub webhook: Option<String>,
    pub connector: Option<String>,
}

/// `GET /status/{session}?after=&verbose=` query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusQuery {
    pub after: Option<i64>,
    #[serde(default)]
    pub verbose: bool,
}

/// One task row as rendered by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusEntry {
    pub id: i64,
    pub index: u32,
    #[serde(rename = "type")]
    pub task_type: crate::types::TaskType,
    pub detail: String,
    pub status: crate::types::TaskStatus,
    pub output: Option<String>,
    /// Only present when `verbose=true`: raw LLM input/output for this
    /// task's executor and review calls.
    pub raw_llm: Option<Vec<String>>,
}

/// `GET /status/{session}` response body.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub plan: Option<crate::types::Plan>,
    pub tasks: Vec<TaskStatusEntry>,
    pub queue_length: usize,
    pub active_task: Option<i64>,
    pub worker_running: bool,
}

/// `POST /admin/reload-env` response body.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadEnvResponse {
    pub reloaded_keys: Vec<String>,
}

/// `GET /pub/{id}` resolution result: an absolute, traversal-checked
/// filesystem path plus the original filename for a `Content-Disposition`
/// header, or `None` if the token does not resolve.
#[derive(Debug, Clone)]
pub struct PublishedFileResolution {
    pub path: std::path::PathBuf,
    pub filename: String,
}

/// `GET /health` response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self { status: "ok" }
    }
}

/// The webhook callback body POSTed to a session's configured webhook URL
/// for every `msg` task that reaches `done` (§4.4).
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub session: String,
    pub task_id: i64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: String,
    #[serde(rename = "final")]
    pub final_: bool,
}

impl WebhookPayload {
    #[must_use]
    pub fn new(session: impl Into<String>, task_id: i64, content: impl Into<String>, final_: bool) -> Self {
        Self { session: session.into(), task_id, kind: "msg", content: content.into(), final_ }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_payload_serializes_final_as_final() {
        let payload = WebhookPayload::new("s1", 42, "done", true);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["final"], true);
        assert_eq!(json["type"], "msg");
        assert_eq!(json["task_id"], 42);
    }

    #[test]
    fn test_health_response_default_is_ok() {
        let resp = HealthResponse::default();
        assert_eq!(resp.status, "ok");
    }
}
