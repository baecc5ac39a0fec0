//! Scheduler & Session Worker (C9/C10, §4.1): the per-session queue and
//! single-worker runtime that turns `Scheduler::ingest` calls into plan
//! runtime attempts.
//!
//! A `tokio::sync::Mutex<HashMap<SessionId, WorkerHandle>>` is held across
//! the lookup-and-insert so two concurrent `ingest` calls for a session
//! neither spawn duplicate workers nor lose a message.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::config::{AccessConfig, BudgetConfig, KnowledgeConfig, LlmConfig, Role as AccessRole, RuntimeConfig};
use crate::contract::{
    CallerContext, CancelResponse, HealthResponse, MsgResponse, PublishedFileResolution,
    ReloadEnvResponse, SessionResponse, SessionSummary, StatusResponse, TaskStatusEntry,
};
use crate::kernel::audit::AuditLog;
use crate::kernel::hooks;
use crate::kernel::plan::{self, PlanDeps};
use crate::kernel::roles::{self, Role as PipelineRole, RoleContext};
use crate::kernel::template::TemplateRegistry;
use crate::llm::{LlmGateway, MessageBudget};
use crate::sanitizer::{Fencer, Sanitizer};
use crate::secrets::{DeploySecrets, EphemeralSecrets};
use crate::skills::{ArgType, InstalledSkill, SkillRegistry};
use crate::store::Store;
use crate::types::{Message, MessageRole, Session};

/// The message and resolved caller identity carried across the ingest
/// boundary into a session's queue (§4.1 step 3). Never persisted beyond
/// the message row itself.
struct QueuedMessage {
    message: Message,
    caller: CallerContext,
}

/// A spawned session worker's sending half plus bookkeeping `status`
/// needs without reaching into the channel internals.
struct WorkerHandle {
    tx: mpsc::Sender<QueuedMessage>,
    buffer_size: usize,
}

/// Everything a session worker needs that is shared across every session,
/// built once at startup by the composition root.
pub struct SchedulerState {
    pub store: Store,
    pub gateway: LlmGateway,
    pub llm_config: LlmConfig,
    pub runtime: RuntimeConfig,
    pub budget_config: BudgetConfig,
    pub knowledge: KnowledgeConfig,
    pub access: AccessConfig,
    pub registry: SkillRegistry,
    pub templates: TemplateRegistry,
    pub fencer: Fencer,
    pub sanitizer: Sanitizer,
    pub audit: AuditLog,
    pub deploy_secrets: DeploySecrets,
    pub http_client: reqwest::Client,
    /// Root directory under which each session gets its own workspace
    /// subdirectory (`{sessions_root}/{session_id}`).
    pub sessions_root: PathBuf,
    /// OS user `exec` tasks run as for non-admin callers.
    pub restricted_os_user: String,
}

/// Owns every session's worker and queue. The library-level entry points
/// (`ingest`/`cancel`/`status`) are what an external HTTP layer drives;
/// this crate does not open a listening socket itself.
pub struct Scheduler {
    state: Arc<SchedulerState>,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
}

impl Scheduler {
    /// Build a scheduler over the given shared state. Spawns no workers
    /// until a message is ingested.
    #[must_use]
    pub fn new(state: SchedulerState) -> Self {
        Self { state: Arc::new(state), workers: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// `POST /msg` (§6): ensure the session exists, insert the message
    /// row, and — iff the caller is trusted — enqueue it for processing.
    /// An untrusted caller still gets a `queued: true` response; the
    /// message is stored `trusted=0` and never picked up by a worker.
    ///
    /// # Errors
    ///
    /// Returns an error only for store I/O failures.
    pub async fn ingest(
        &self,
        session_id: &str,
        caller: CallerContext,
        content: &str,
        webhook: Option<&str>,
    ) -> anyhow::Result<MsgResponse> {
        self.state.store.ensure_session(session_id, webhook, None).await?;
        let message_id = self
            .state
            .store
            .insert_message(session_id, &caller.user, MessageRole::User, content, caller.trusted)
            .await?;

        if caller.trusted {
            let message = Message {
                id: message_id,
                session: session_id.to_string(),
                user: caller.user.clone(),
                role: MessageRole::User,
                content: content.to_string(),
                trusted: true,
                processed: false,
                created_at: chrono::Utc::now(),
            };
            self.enqueue(session_id, QueuedMessage { message, caller }).await?;
        }

        Ok(MsgResponse { queued: true, session: session_id.to_string() })
    }

    /// `POST /sessions/{s}/cancel` (§6): set the cancel flag; the worker
    /// observes it at the next suspension-point check between tasks.
    ///
    /// # Errors
    ///
    /// Returns an error only for store I/O failures.
    pub async fn cancel(&self, session_id: &str) -> anyhow::Result<CancelResponse> {
        self.state.store.set_cancel_requested(session_id, true).await?;
        let plan = self.state.store.latest_plan_for_session(session_id).await?;
        Ok(CancelResponse { cancelled: true, plan_id: plan.map(|p| p.id) })
    }

    /// `POST /sessions` (§6): create a session (or no-op if it already
    /// exists) with an explicit webhook/connector, ahead of any `/msg`.
    ///
    /// # Errors
    ///
    /// Returns an error only for store I/O failures.
    pub async fn create_or_update_session(
        &self,
        session_id: &str,
        webhook: Option<&str>,
    ) -> anyhow::Result<SessionResponse> {
        let existed = self.state.store.get_session(session_id).await?.is_some();
        self.state.store.ensure_session(session_id, webhook, None).await?;
        Ok(SessionResponse { session: session_id.to_string(), created: !existed })
    }

    /// `GET /sessions?all=` (§6): every known session id, paired with its
    /// webhook and connector.
    ///
    /// # Errors
    ///
    /// Returns an error only for store I/O failures.
    pub async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for id in self.state.store.list_session_ids().await? {
            if let Some(session) = self.state.store.get_session(&id).await? {
                summaries.push(SessionSummary {
                    session: session.id,
                    webhook: session.webhook,
                    connector: session.connector,
                });
            }
        }
        Ok(summaries)
    }

    /// `POST /admin/reload-env` (§6): re-read the deploy secrets
    /// directory and record the keys now present for audit.
    ///
    /// # Errors
    ///
    /// Returns an error if the secrets directory exists but cannot be read,
    /// or a store write fails.
    pub async fn reload_deploy_secrets(&self) -> anyhow::Result<ReloadEnvResponse> {
        let keys = self.state.deploy_secrets.reload().await?;
        for key in &keys {
            self.state.store.record_deploy_secret_loaded(key).await?;
        }
        Ok(ReloadEnvResponse { reloaded_keys: keys })
    }

    /// `GET /pub/{id}` (§6): resolve a published-file token to an
    /// absolute path, rejecting anything that would escape the session's
    /// `pub/` directory.
    ///
    /// # Errors
    ///
    /// Returns an error only for store I/O failures. Returns `Ok(None)`
    /// for an unknown token.
    pub async fn resolve_published_file(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<PublishedFileResolution>> {
        let Some(file) = self.state.store.get_published_file(token).await? else {
            return Ok(None);
        };
        let pub_dir = self.state.sessions_root.join(&file.session).join("pub");
        let path = pub_dir.join(&file.relative_path);

        let Ok(canonical_pub_dir) = pub_dir.canonicalize() else {
            return Ok(None);
        };
        let Ok(canonical_path) = path.canonicalize() else {
            return Ok(None);
        };
        if !canonical_path.starts_with(&canonical_pub_dir) {
            tracing::warn!(token, "published file token resolved outside its session's pub directory");
            return Ok(None);
        }

        Ok(Some(PublishedFileResolution { path: canonical_path, filename: file.filename }))
    }

    /// `GET /health` (§6): always `ok` once the scheduler is constructed —
    /// there is no external dependency whose outage should flip this.
    #[must_use]
    pub fn health(&self) -> HealthResponse {
        HealthResponse::default()
    }

    /// `GET /status/{session}` (§6): the latest plan, its tasks, and
    /// worker/queue bookkeeping. `raw_llm` is always `None` — this
    /// scheduler does not retain per-task raw completions; a `verbose`
    /// caller gets them from the audit log instead.
    ///
    /// # Errors
    ///
    /// Returns an error only for store I/O failures.
    pub async fn status(&self, session_id: &str) -> anyhow::Result<StatusResponse> {
        let plan = self.state.store.latest_plan_for_session(session_id).await?;
        let tasks = match &plan {
            Some(p) => self.state.store.tasks_for_plan(p.id).await?,
            None => Vec::new(),
        };
        let task_entries = tasks
            .into_iter()
            .map(|t| TaskStatusEntry {
                id: t.id,
                index: t.index,
                task_type: t.task_type,
                detail: t.detail,
                status: t.status,
                output: t.output,
                raw_llm: None,
            })
            .collect();

        let workers = self.workers.lock().await;
        let (queue_length, worker_running) = match workers.get(session_id) {
            Some(handle) => (handle.buffer_size.saturating_sub(handle.tx.capacity()), true),
            None => (0, false),
        };

        Ok(StatusResponse { plan, tasks: task_entries, queue_length, active_task: None, worker_running })
    }

    /// The atomic check-and-spawn (§4.1): held across the lookup and
    /// insert so no suspension point exists between observing that a
    /// session has no worker and registering the one we spawn for it.
    ///
    /// A worker that times out idle breaks its receive loop and only
    /// afterward takes this lock to remove itself, so a concurrent
    /// `enqueue` can observe a handle whose channel looks alive, send into
    /// its buffer, and still lose the message once the worker drops its
    /// receiver. Rather than make that removal race-free (the worker would
    /// still need to win a lock against every racing `enqueue`), treat a
    /// failed send as "the worker we saw is already gone": loop back and
    /// spawn a fresh one. This keeps at-least-once delivery without
    /// depending on the exact interleaving of shutdown and enqueue.
    async fn enqueue(&self, session_id: &str, queued: QueuedMessage) -> anyhow::Result<()> {
        let mut queued = queued;
        loop {
            let tx = {
                let mut workers = self.workers.lock().await;
                let needs_spawn = match workers.get(session_id) {
                    Some(handle) => handle.tx.is_closed(),
                    None => true,
                };
                if needs_spawn {
                    let (tx, rx) = mpsc::channel(self.state.runtime.channel_buffer_size);
                    workers.insert(
                        session_id.to_string(),
                        WorkerHandle { tx, buffer_size: self.state.runtime.channel_buffer_size },
                    );
                    tokio::spawn(run_worker(
                        Arc::clone(&self.state),
                        session_id.to_string(),
                        rx,
                        Arc::clone(&self.workers),
                    ));
                }
                workers.get(session_id).expect("just inserted or already present").tx.clone()
            };

            match tx.send(queued).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    tracing::debug!(
                        session = session_id,
                        "enqueue raced a worker's idle shutdown, respawning"
                    );
                    queued = returned;
                }
            }
        }
    }

    /// Run startup recovery (§4.1, §8 invariant 9): fail stuck tasks and
    /// plans, then re-enqueue every unprocessed trusted message. Caller
    /// resolution for a re-enqueued message defaults to the non-admin,
    /// no-skills grant — the original caller identity was never
    /// persisted, only the message row survives a restart.
    ///
    /// # Errors
    ///
    /// Returns an error only for store I/O failures.
    pub async fn recover(&self) -> anyhow::Result<crate::store::RecoveryReport> {
        let report = self.state.store.recover().await?;
        for message in &report.messages_to_enqueue {
            let grant = self.state.access.grant_for(&message.user);
            let caller = CallerContext {
                user: message.user.clone(),
                role: grant.role,
                allowed_skills: grant.allowed_skills,
                trusted: true,
            };
            self.enqueue(&message.session, QueuedMessage { message: message.clone(), caller }).await?;
        }
        Ok(report)
    }
}

/// One session worker's main loop: block on the queue (racing an idle
/// timeout), mark the message processed before any LLM work, run the
/// plan runtime, run post-execution hooks, repeat. Exits — removing
/// itself from the registry — when the queue is empty past the idle
/// timeout or its channel is dropped.
async fn run_worker(
    state: Arc<SchedulerState>,
    session_id: String,
    mut rx: mpsc::Receiver<QueuedMessage>,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
) {
    let idle_timeout = Duration::from_secs(state.runtime.worker_idle_timeout_seconds);
    loop {
        let queued = match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(queued)) => queued,
            Ok(None) => break,
            Err(_) => break,
        };
        if let Err(e) = process_message(&state, &session_id, queued).await {
            tracing::error!(session = %session_id, error = %e, "session worker failed processing message");
        }
    }
    workers.lock().await.remove(&session_id);
    tracing::info!(session = %session_id, "session worker idle, shutting down");
}

async fn process_message(
    state: &SchedulerState,
    session_id: &str,
    queued: QueuedMessage,
) -> anyhow::Result<()> {
    state.store.mark_message_processed(queued.message.id).await?;

    let Some(session) = state.store.get_session(session_id).await? else {
        tracing::warn!(session = %session_id, "message queued for a session that no longer exists");
        return Ok(());
    };

    let workspace = state.sessions_root.join(session_id);
    std::fs::create_dir_all(&workspace)
        .map_err(|e| anyhow::anyhow!("failed to create session workspace {}: {e}", workspace.display()))?;

    let base_ctx = assemble_base_context(state, &session, &queued.caller).await?;
    let mut ephemeral = EphemeralSecrets::new();
    let budget = MessageBudget::new(state.llm_config.max_llm_calls_per_message);
    let deps = PlanDeps {
        store: &state.store,
        gateway: &state.gateway,
        budget: &budget,
        llm_config: &state.llm_config,
        runtime: &state.runtime,
        budget_config: &state.budget_config,
        access: &state.access,
        registry: &state.registry,
        templates: &state.templates,
        fencer: &state.fencer,
        sanitizer: &state.sanitizer,
        audit: &state.audit,
        deploy_secrets: &state.deploy_secrets,
        http_client: &state.http_client,
        workspace: &workspace,
        restricted_os_user: &state.restricted_os_user,
    };

    let outcome = plan::run_plan(&deps, &session, &queued.message, &queued.caller, base_ctx, &mut ephemeral).await?;
    tracing::info!(session = %session_id, outcome = ?outcome, "plan attempt finished");

    hooks::run_post_execution_hooks(
        &state.store,
        &state.gateway,
        &budget,
        &state.llm_config,
        &state.templates,
        &state.knowledge,
        session_id,
    )
    .await?;

    Ok(())
}

/// Assemble the parts of [`RoleContext`] that do not change across a
/// message's plan attempts (§4.7): session summary, recent conversation
/// split into trusted raw messages and a paraphrased untrusted batch,
/// recent `msg` outputs, facts, open pending items, allowed skills, and
/// caller role.
async fn assemble_base_context(
    state: &SchedulerState,
    session: &Session,
    caller: &CallerContext,
) -> anyhow::Result<RoleContext> {
    let mut ctx = RoleContext::default();

    if !session.summary.is_empty() {
        ctx.session_summary = Some(session.summary.clone());
    }

    let recent = state.store.recent_messages(&session.id, 20).await?;
    let (trusted, untrusted): (Vec<Message>, Vec<Message>) = recent.into_iter().partition(|m| m.trusted);
    ctx.recent_trusted_messages = trusted.iter().map(|m| format!("{}: {}", m.user, m.content)).collect();

    let untrusted_batch: Vec<String> = untrusted.iter().map(|m| m.content.clone()).collect();
    if !untrusted_batch.is_empty() {
        ctx.untrusted_batch = untrusted_batch.clone();
        let mut paraphrase_ctx = ctx.clone();
        paraphrase_ctx.untrusted_batch = untrusted_batch;
        let prompt = state.templates.load(PipelineRole::Paraphraser);
        let budget = MessageBudget::new(state.llm_config.max_llm_calls_per_message);
        match roles::invoke_paraphraser(&state.gateway, &budget, &state.llm_config, &prompt, &paraphrase_ctx, &state.fencer).await {
            Ok(completion) => ctx.paraphrased_untrusted = vec![completion.text],
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "paraphraser call failed, dropping untrusted context for this message");
            }
        }
    }

    ctx.recent_msg_outputs = state.store.recent_msg_outputs(&session.id, 10).await?;
    ctx.facts = state.store.facts_visible_to(&session.id).await?;
    ctx.pending_items = state.store.open_pending_items(&session.id).await?;

    let allowed = if caller.role == AccessRole::Admin { None } else { Some(caller.allowed_skills.as_slice()) };
    ctx.allowed_skills = state
        .registry
        .allowed_summaries(allowed)
        .iter()
        .map(|s| (s.name().to_string(), s.manifest.kiso.skill.summary.clone(), skill_args_schema_json(s)))
        .collect();

    ctx.caller_role = Some(caller.role);
    ctx.system_environment = Some(format!(
        "Linux session workspace at {}; caller role: {:?}",
        state.sessions_root.join(&session.id).display(),
        caller.role
    ));

    Ok(ctx)
}

fn skill_args_schema_json(skill: &InstalledSkill) -> String {
    let mut props = serde_json::Map::new();
    for (name, spec) in &skill.manifest.kiso.skill.args {
        props.insert(
            name.clone(),
            serde_json::json!({
                "type": arg_type_label(spec.kind),
                "required": spec.required,
                "description": spec.description,
            }),
        );
    }
    serde_json::Value::Object(props).to_string()
}

fn arg_type_label(kind: ArgType) -> &'static str {
    match kind {
        ArgType::String => "string",
        ArgType::Integer => "integer",
        ArgType::Number => "number",
        ArgType::Boolean => "boolean",
        ArgType::Array => "array",
        ArgType::Object => "object",
    }
}
