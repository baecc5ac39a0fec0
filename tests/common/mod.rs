//! Shared fixtures for Kiso's integration tests: a scripted
//! `InferenceProvider` that plays back one response per call in a fixed
//! order, and a full `Scheduler` builder for end-to-end scenarios.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use kiso::config::{AccessConfig, BudgetConfig, KnowledgeConfig, LlmConfig, Role as AccessRole, RuntimeConfig, UserGrant};
use kiso::contract::{CallerContext, StatusResponse};
use kiso::kernel::audit::AuditLog;
use kiso::kernel::scheduler::{Scheduler, SchedulerState};
use kiso::kernel::template::TemplateRegistry;
use kiso::llm::{Completion, InferenceProvider, LlmError, LlmGateway, LlmMessage};
use kiso::sanitizer::{Fencer, Sanitizer};
use kiso::secrets::DeploySecrets;
use kiso::skills::SkillRegistry;
use kiso::store::Store;

/// Plays back one canned response per call, in the order a scenario's
/// planner/reviewer/role calls are expected to issue them. Running out of
/// scripted responses is a test-authoring bug, not a real provider outage,
/// so it fails loudly via `RequestFailed` rather than panicking across an
/// async boundary.
pub struct ScriptedProvider {
    responses: AsyncMutex<VecDeque<String>>,
    call_count: AsyncMutex<usize>,
    pause: Option<PauseGate>,
}

/// Lets a test synchronize with a specific LLM call instead of racing it
/// with sleeps: the provider notifies `paused` right before serving the
/// `before_call`-th response (0-indexed across the whole scenario, in
/// call order), then blocks until the test notifies `resume`.
struct PauseGate {
    before_call: usize,
    paused: Arc<Notify>,
    resume: Arc<Notify>,
}

impl ScriptedProvider {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: AsyncMutex::new(responses.into_iter().map(Into::into).collect()),
            call_count: AsyncMutex::new(0),
            pause: None,
        }
    }

    /// Like [`Self::new`], but pauses before serving the `before_call`-th
    /// response until `resume` is notified, having first notified `paused`
    /// so the test knows it is safe to act (e.g. issue a cancel) while the
    /// plan runtime is mid-task.
    pub fn with_pause(
        responses: impl IntoIterator<Item = impl Into<String>>,
        before_call: usize,
        paused: Arc<Notify>,
        resume: Arc<Notify>,
    ) -> Self {
        Self {
            responses: AsyncMutex::new(responses.into_iter().map(Into::into).collect()),
            call_count: AsyncMutex::new(0),
            pause: Some(PauseGate { before_call, paused, resume }),
        }
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    async fn complete(
        &self,
        model: &str,
        _messages: &[LlmMessage],
        _max_tokens: u32,
        _schema: Option<&Value>,
    ) -> Result<Completion, LlmError> {
        let call_index = {
            let mut count = self.call_count.lock().await;
            let idx = *count;
            *count += 1;
            idx
        };
        if let Some(gate) = &self.pause {
            if call_index == gate.before_call {
                gate.paused.notify_one();
                gate.resume.notified().await;
            }
        }
        let mut queue = self.responses.lock().await;
        let text = queue
            .pop_front()
            .ok_or_else(|| LlmError::RequestFailed("scripted provider ran out of responses".to_string()))?;
        Ok(Completion { text, input_tokens: 10, output_tokens: 5, model: model.to_string() })
    }
}

/// A fully-wired `Scheduler` plus the temp directories it was built from,
/// kept alive for the fixture's lifetime.
pub struct Fixture {
    pub scheduler: Scheduler,
    audit_dir: tempfile::TempDir,
    _sessions_root: tempfile::TempDir,
    _roles_dir: tempfile::TempDir,
    _skills_dir: tempfile::TempDir,
}

impl Fixture {
    /// Parse every audit JSONL entry written so far, across all of the
    /// sink's daily files (tests run well within a single day, but this
    /// does not assume it).
    pub fn audit_entries(&self) -> Vec<Value> {
        let mut entries = Vec::new();
        let Ok(read_dir) = std::fs::read_dir(self.audit_dir.path()) else {
            return entries;
        };
        for entry in read_dir.flatten() {
            let Ok(contents) = std::fs::read_to_string(entry.path()) else { continue };
            for line in contents.lines() {
                if let Ok(value) = serde_json::from_str::<Value>(line) {
                    entries.push(value);
                }
            }
        }
        entries
    }
}

/// Build a `Scheduler` whose LLM gateway is scripted with `responses`, with
/// `admin_user` granted the admin role so `exec` tasks run without needing
/// a real `sudo`-capable restricted OS user on the test host.
pub async fn build_fixture(responses: Vec<&str>, admin_user: &str) -> Fixture {
    let provider: Arc<dyn InferenceProvider> = Arc::new(ScriptedProvider::new(responses));
    build_fixture_with_provider(provider, admin_user).await
}

/// Like [`build_fixture`], but takes an already-constructed provider, for
/// scenarios that need [`ScriptedProvider::with_pause`] to synchronize a
/// test action with a specific point in the plan runtime.
pub async fn build_fixture_with_provider(provider: Arc<dyn InferenceProvider>, admin_user: &str) -> Fixture {
    let store = Store::open_in_memory().await.expect("open in-memory store");
    let sessions_root = tempfile::tempdir().expect("sessions root");
    let audit_dir = tempfile::tempdir().expect("audit dir");
    let roles_dir = tempfile::tempdir().expect("roles dir");
    let skills_dir = tempfile::tempdir().expect("skills dir");

    let gateway = LlmGateway::new(provider, None, None);

    let mut users = HashMap::new();
    users.insert(admin_user.to_string(), UserGrant { role: AccessRole::Admin, allowed_skills: vec![] });

    let state = SchedulerState {
        store,
        gateway,
        llm_config: LlmConfig::default(),
        runtime: RuntimeConfig::default(),
        budget_config: BudgetConfig::default(),
        knowledge: KnowledgeConfig::default(),
        access: AccessConfig { users },
        registry: SkillRegistry::new(skills_dir.path()),
        templates: TemplateRegistry::new(roles_dir.path()),
        fencer: Fencer::new(),
        sanitizer: Sanitizer::new(),
        audit: AuditLog::new(audit_dir.path()),
        deploy_secrets: DeploySecrets::new(),
        http_client: reqwest::Client::new(),
        sessions_root: sessions_root.path().to_path_buf(),
        restricted_os_user: "kiso-sandbox".to_string(),
    };

    Fixture {
        scheduler: Scheduler::new(state),
        audit_dir,
        _sessions_root: sessions_root,
        _roles_dir: roles_dir,
        _skills_dir: skills_dir,
    }
}

/// A trusted caller with the given role, no skill restrictions.
#[must_use]
pub fn trusted_caller(user: &str, role: AccessRole) -> CallerContext {
    CallerContext { user: user.to_string(), role, allowed_skills: vec![], trusted: true }
}

/// An unrecognized caller — `ingest` still returns `queued: true`, but the
/// message is stored untrusted and never reaches a worker.
#[must_use]
pub fn untrusted_caller(user: &str) -> CallerContext {
    CallerContext { user: user.to_string(), role: AccessRole::User, allowed_skills: vec![], trusted: false }
}

/// Poll `/status` until the session's latest plan reaches a terminal
/// status, then give post-execution hooks a little more time to finish
/// before returning. Panics if the plan never settles, since that means
/// the scenario's scripted responses did not match what the plan runtime
/// actually asked for.
pub async fn wait_for_plan_terminal(scheduler: &Scheduler, session: &str) -> StatusResponse {
    for _ in 0..300 {
        let status = scheduler.status(session).await.expect("status query");
        if let Some(plan) = &status.plan {
            if plan.status.is_terminal() {
                tokio::time::sleep(Duration::from_millis(30)).await;
                return scheduler.status(session).await.expect("status query");
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("plan for session '{session}' never reached a terminal status");
}

/// A minimal valid planner JSON response: one task, then a closing `msg`.
#[must_use]
pub fn planner_json(goal: &str, tasks_json: &str) -> String {
    format!(r#"{{"goal":"{goal}","secrets":null,"tasks":{tasks_json},"extend_replan":null}}"#)
}

/// A planner JSON response that also emits an ephemeral secret.
#[must_use]
pub fn planner_json_with_secret(goal: &str, tasks_json: &str, key: &str, value: &str) -> String {
    format!(
        r#"{{"goal":"{goal}","secrets":[{{"key":"{key}","value":"{value}"}}],"tasks":{tasks_json},"extend_replan":null}}"#
    )
}

/// A reviewer `ok` verdict.
pub const REVIEW_OK: &str = r#"{"status":"ok","reason":null,"learn":null}"#;

/// A reviewer `replan` verdict with the given reason.
#[must_use]
pub fn review_replan(reason: &str) -> String {
    format!(r#"{{"status":"replan","reason":"{reason}","learn":null}}"#)
}

/// A deserializable mirror of [`kiso::contract::WebhookPayload`]'s wire
/// shape, since that type only derives `Serialize`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CapturedWebhookPayload {
    pub session: String,
    pub task_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(rename = "final")]
    pub final_: bool,
}

/// A minimal raw-socket HTTP server capturing every JSON body POSTed to
/// it, for asserting on webhook deliveries without pulling in a mocking
/// dependency the rest of the crate does not otherwise need.
pub struct WebhookCapture {
    pub url: String,
    payloads: Arc<AsyncMutex<Vec<CapturedWebhookPayload>>>,
}

impl WebhookCapture {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind webhook listener");
        let addr = listener.local_addr().expect("webhook listener local addr");
        let url = format!("http://{addr}/webhook");
        let payloads: Arc<AsyncMutex<Vec<CapturedWebhookPayload>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let accept_payloads = Arc::clone(&payloads);

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                let payloads = Arc::clone(&accept_payloads);
                tokio::spawn(handle_webhook_connection(socket, payloads));
            }
        });

        Self { url, payloads }
    }

    /// Snapshot every payload captured so far, in delivery order.
    pub async fn payloads(&self) -> Vec<CapturedWebhookPayload> {
        self.payloads.lock().await.clone()
    }
}

async fn handle_webhook_connection(
    mut socket: tokio::net::TcpStream,
    payloads: Arc<AsyncMutex<Vec<CapturedWebhookPayload>>>,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut header_end = None;
    let mut content_length = None;

    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        if header_end.is_none() {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                header_end = Some(pos + 4);
                let header_text = String::from_utf8_lossy(&buf[..pos]);
                for line in header_text.lines() {
                    if let Some(rest) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = rest.trim().parse::<usize>().ok();
                    }
                }
            }
        }

        if let (Some(start), Some(len)) = (header_end, content_length) {
            if buf.len() >= start.saturating_add(len) {
                break;
            }
        }
    }

    if let (Some(start), Some(len)) = (header_end, content_length) {
        if let Some(body) = buf.get(start..start.saturating_add(len)) {
            if let Ok(payload) = serde_json::from_slice::<CapturedWebhookPayload>(body) {
                payloads.lock().await.push(payload);
            }
        }
    }

    let _ = socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
