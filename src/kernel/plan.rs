//! Plan Runtime (C8, §4.2): the iterative per-message loop that turns one
//! planner call into a sequence of reviewed, executed tasks, re-planning
//! on a reviewer- or policy-triggered failure and delivering the final
//! `msg` task's output.
//!
//! A plan's task list is dynamic and a replan re-enters at the planner
//! rather than at a fixed phase boundary, so this is modeled as a loop
//! over plan attempts rather than a fixed sequence of stages.

use std::collections::HashMap;
use std::path::Path;

use crate::config::{AccessConfig, BudgetConfig, LlmConfig, RuntimeConfig};
use crate::contract::{CallerContext, WebhookPayload};
use crate::kernel::audit::{AuditEntry, AuditLog};
use crate::kernel::egress;
use crate::kernel::executor::{self, ExecutionResult};
use crate::kernel::policy::{self, PolicyError};
use crate::kernel::roles::context::{FailureContext, ReplanHistoryEntry};
use crate::kernel::roles::{self, ReviewerOutput, ReviewerVerdict, Role as PipelineRole, RoleContext};
use crate::kernel::template::TemplateRegistry;
use crate::llm::{LlmError, LlmGateway, MessageBudget};
use crate::sanitizer::{Fencer, Sanitizer};
use crate::secrets::{DeploySecrets, EphemeralSecret, EphemeralSecrets};
use crate::skills::SkillRegistry;
use crate::store::{NewTask, Store};
use crate::types::{Message, PlanOutputEntry, PlanStatus, Session, Task, TaskStatus, TaskType};

/// How a plan attempt finished.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// The final `msg` task ran and (if a webhook was configured) was
    /// delivered.
    Delivered,
    /// The session's cancel flag was observed mid-plan.
    Cancelled,
    /// Replanning was exhausted, or a hard LLM Gateway failure left no
    /// output to review.
    Failed(String),
}

/// Everything the Plan Runtime needs that does not change across plan
/// attempts for one message.
pub struct PlanDeps<'a> {
    pub store: &'a Store,
    pub gateway: &'a LlmGateway,
    pub budget: &'a MessageBudget,
    pub llm_config: &'a LlmConfig,
    pub runtime: &'a RuntimeConfig,
    pub budget_config: &'a BudgetConfig,
    pub access: &'a AccessConfig,
    pub registry: &'a SkillRegistry,
    pub templates: &'a TemplateRegistry,
    pub fencer: &'a Fencer,
    pub sanitizer: &'a Sanitizer,
    pub audit: &'a AuditLog,
    pub deploy_secrets: &'a DeploySecrets,
    pub http_client: &'a reqwest::Client,
    pub workspace: &'a Path,
    pub restricted_os_user: &'a str,
}

/// Run the full plan-with-replan loop for one inbound `message`.
///
/// `base_ctx` carries the parts of [`RoleContext`] that do not change
/// across tasks or replans (session summary, recent conversation,
/// paraphrased untrusted batch, facts, pending items, allowed skills,
/// caller role, system environment) — the caller assembles these from a
/// store snapshot once per message. This function fills in the
/// per-attempt and per-task fields (`new_message`, `replan_history`,
/// `failure`, `preceding_plan_outputs`, `current_task_*`) itself.
///
/// # Errors
///
/// Returns an error only for store I/O failures; every LLM and policy
/// failure is folded into [`PlanOutcome::Failed`].
pub async fn run_plan(
    deps: &PlanDeps<'_>,
    session: &Session,
    message: &Message,
    caller: &CallerContext,
    base_ctx: RoleContext,
    ephemeral: &mut EphemeralSecrets,
) -> anyhow::Result<PlanOutcome> {
    let outcome = run_plan_inner(deps, session, message, caller, base_ctx, ephemeral).await;
    // §4.2 "Task output chaining": the file mirrors the in-flight
    // plan-outputs array only for the duration of one plan attempt; once
    // this message's processing terminates (any outcome) it is removed.
    executor::remove_plan_outputs_file(deps.workspace);
    outcome
}

async fn run_plan_inner(
    deps: &PlanDeps<'_>,
    session: &Session,
    message: &Message,
    caller: &CallerContext,
    mut base_ctx: RoleContext,
    ephemeral: &mut EphemeralSecrets,
) -> anyhow::Result<PlanOutcome> {
    let allowed_skills = if caller.role == crate::config::Role::Admin {
        None
    } else {
        Some(caller.allowed_skills.as_slice())
    };

    let mut parent_plan_id: Option<i64> = None;
    let mut replan_history: Vec<ReplanHistoryEntry> = Vec::new();
    let mut depth: u8 = 0;
    let mut extend_budget: u8 = 0;
    base_ctx.new_message = Some(message.content.clone());

    loop {
        if session_cancelled(deps.store, &session.id).await? {
            // `parent_plan_id`, if set, already reached a terminal status
            // (`failed`, from the prior replan branch) before this
            // iteration began — a plan's terminal state is final (§8
            // invariant 4), so it is left untouched here rather than
            // overwritten to `cancelled`. No new plan/task rows exist yet
            // for this attempt, so there is no in-flight work to mark
            // cancelled or to summarize.
            return Ok(PlanOutcome::Cancelled);
        }

        base_ctx.replan_history = replan_history.clone();
        let planner_prompt = deps.templates.load(PipelineRole::Planner);
        let planner_result = roles::invoke_planner(
            deps.gateway,
            deps.budget,
            deps.llm_config,
            &planner_prompt,
            &base_ctx,
            deps.fencer,
            deps.registry,
            allowed_skills,
            deps.runtime.max_validation_retries,
        )
        .await;

        let (planner_output, completion) = match planner_result {
            Ok(v) => v,
            Err(e) => return Ok(PlanOutcome::Failed(format!("planner failed: {e}"))),
        };
        deps.audit.record(AuditEntry::Llm {
            session: session.id.clone(),
            role: PipelineRole::Planner.as_str().to_string(),
            model: completion.model.clone(),
            provider: deps.llm_config.primary_route().0.to_string(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            duration_ms: 0,
            status: "ok",
        });

        if let Some(secrets) = planner_output.secrets {
            ephemeral.extend(
                secrets.into_iter().map(|s| EphemeralSecret { key: s.key, value: s.value }),
            );
        }
        let requested_extend = planner_output.extend_replan.unwrap_or(0).min(deps.budget_config.max_extend_replan);
        extend_budget = extend_budget.max(requested_extend);

        let plan_id = deps.store.create_plan(&session.id, message.id, &planner_output.goal, parent_plan_id).await?;
        if requested_extend > 0 {
            deps.store.set_extend_replan(plan_id, requested_extend).await?;
        }
        deps.store.record_plan_usage(plan_id, completion.input_tokens, completion.output_tokens, &completion.model).await?;

        let args_json: Vec<Option<String>> =
            planner_output.tasks.iter().map(|t| t.args.as_ref().map(ToString::to_string)).collect();
        let new_tasks: Vec<NewTask<'_>> = planner_output
            .tasks
            .iter()
            .zip(&args_json)
            .enumerate()
            .map(|(position, (task, args))| NewTask {
                index: u32::try_from(position + 1).unwrap_or(u32::MAX),
                task_type: task.task_type,
                detail: &task.detail,
                skill: task.skill.as_deref(),
                args: args.as_deref(),
                expect: task.expect.as_deref(),
            })
            .collect();
        deps.store.insert_tasks(plan_id, &new_tasks).await?;

        let outcome = run_tasks(deps, session, caller, &base_ctx, plan_id, ephemeral).await?;

        match outcome {
            TaskLoopOutcome::Done => {
                deps.store.set_plan_status(plan_id, PlanStatus::Done).await?;
                return Ok(PlanOutcome::Delivered);
            }
            TaskLoopOutcome::Cancelled(completed) => {
                deps.store.set_plan_status(plan_id, PlanStatus::Cancelled).await?;
                let summary = synthesize_cancel_summary(&completed);
                deliver_synthetic_msg(deps, &session.id, plan_id, &summary, false).await?;
                return Ok(PlanOutcome::Cancelled);
            }
            TaskLoopOutcome::HardFailure(reason) => {
                deps.store.set_plan_status(plan_id, PlanStatus::Failed).await?;
                return Ok(PlanOutcome::Failed(reason));
            }
            TaskLoopOutcome::Replan(failure) => {
                deps.store.fail_pending_tasks(plan_id).await?;
                deps.store.set_plan_status(plan_id, PlanStatus::Failed).await?;
                depth += 1;
                let total_allowed = deps.runtime.max_replan_depth.saturating_add(extend_budget);
                if depth > total_allowed {
                    let notice = format!(
                        "giving up after {depth} replan attempt(s): {}",
                        failure.reason
                    );
                    deliver_synthetic_msg(deps, &session.id, plan_id, &notice, true).await?;
                    return Ok(PlanOutcome::Failed(failure.reason));
                }
                let notice = format!("replanning: {}", failure.reason);
                deliver_synthetic_msg(deps, &session.id, plan_id, &notice, false).await?;
                replan_history.push(ReplanHistoryEntry { goal: planner_output.goal.clone(), reason: failure.reason.clone() });
                base_ctx.failure = Some(failure);
                parent_plan_id = Some(plan_id);
            }
        }
    }
}

/// Outcome of draining one plan's task list.
enum TaskLoopOutcome {
    Done,
    /// Carries the plan-outputs array as it stood at the moment the
    /// cancel flag was observed, for the cancel-summary `msg` (§4.2 step
    /// 7, §9 open question: "a distinct, worker-emitted message, not a
    /// plan task").
    Cancelled(Vec<PlanOutputEntry>),
    HardFailure(String),
    Replan(FailureContext),
}

async fn run_tasks(
    deps: &PlanDeps<'_>,
    session: &Session,
    caller: &CallerContext,
    base_ctx: &RoleContext,
    plan_id: i64,
    ephemeral: &EphemeralSecrets,
) -> anyhow::Result<TaskLoopOutcome> {
    let tasks = deps.store.tasks_for_plan(plan_id).await?;
    let mut outputs: Vec<PlanOutputEntry> = Vec::new();

    for (position, task) in tasks.iter().enumerate() {
        let is_last = position + 1 == tasks.len();

        if session_cancelled(deps.store, &session.id).await? {
            deps.store.cancel_pending_tasks(plan_id).await?;
            return Ok(TaskLoopOutcome::Cancelled(outputs.clone()));
        }

        if task.task_type == TaskType::Replan {
            return Ok(TaskLoopOutcome::Replan(FailureContext {
                task_detail: task.detail.clone(),
                reason: "the planner emitted an explicit replan task".to_string(),
            }));
        }

        if let (TaskType::Skill, Some(skill_name)) = (task.task_type, task.skill.as_deref()) {
            if let Err(err) = policy::recheck_skill_access(deps.access, &caller.user, skill_name) {
                let reason = policy_failure_reason(&err);
                deps.store.finish_task(task.id, TaskStatus::Failed, None, Some(&reason)).await?;
                return Ok(TaskLoopOutcome::Replan(FailureContext { task_detail: task.detail.clone(), reason }));
            }
        }

        deps.store.start_task(task.id, None).await?;
        let secret_values = collect_secret_values(deps.deploy_secrets, ephemeral).await;
        let dispatch =
            dispatch_task(deps, task, &session.id, base_ctx, caller, &outputs, ephemeral, &secret_values).await;

        let (command, output, stderr, succeeded) = match dispatch {
            Ok(result) => (result.command, result.output, result.stderr, result.succeeded),
            Err(LlmError::BudgetExhausted { limit }) => {
                deps.store.finish_task(
                    task.id,
                    TaskStatus::Failed,
                    None,
                    Some(&format!("per-message LLM call budget of {limit} exhausted")),
                )
                .await?;
                return Ok(TaskLoopOutcome::HardFailure(format!(
                    "per-message LLM call budget of {limit} exhausted"
                )));
            }
            Err(e) => {
                let reason = format!("task execution failed: {e}");
                deps.store.finish_task(task.id, TaskStatus::Failed, None, Some(&reason)).await?;
                return Ok(TaskLoopOutcome::Replan(FailureContext { task_detail: task.detail.clone(), reason }));
            }
        };

        if task.task_type == TaskType::Exec {
            deps.store.start_task(task.id, command.as_deref()).await?;
        }
        let task_status = if succeeded { TaskStatus::Done } else { TaskStatus::Failed };
        deps.store.finish_task(task.id, task_status, Some(&output), stderr.as_deref()).await?;
        deps.audit.record(AuditEntry::Task {
            session: session.id.clone(),
            task_id: task.id,
            task_type: task_type_label(task.task_type).to_string(),
            detail: task.detail.clone(),
            status: task_status_label(task_status).to_string(),
            duration_ms: 0,
            output_length: output.len(),
        });

        let entry = PlanOutputEntry {
            index: task.index,
            task_type: task.task_type,
            detail: task.detail.clone(),
            output: output.clone(),
            status: task_status,
        };
        outputs.push(entry.clone());

        // §4.2 step 7 routes only exec/skill/search through the reviewer;
        // `msg` is delivered directly (a reviewer `replan` verdict on the
        // terminal `msg` would otherwise abort delivery of a correct
        // answer, and every `msg` would burn an extra LLM call against a
        // null `expect`). `replan` tasks are handled before dispatch and
        // never reach this point (see the loop-top check above).
        if task.task_type == TaskType::Msg {
            deliver_final_message(deps, &session.id, task.id, &output, is_last).await;
            continue;
        }

        let review = review_task(deps, session, task, base_ctx, deps.fencer, &entry).await?;
        if let Some(learn) = &review.learn {
            deps.store.insert_learning(learn, &session.id).await?;
        }

        if review.status == ReviewerVerdict::Replan {
            let reason = review
                .reason
                .clone()
                .unwrap_or_else(|| "reviewer requested a replan without a reason".to_string());
            return Ok(TaskLoopOutcome::Replan(FailureContext { task_detail: task.detail.clone(), reason }));
        }
    }

    Ok(TaskLoopOutcome::Done)
}

/// Dispatch one task by type, returning the sanitized/truncated result a
/// reviewer can judge. Only a genuine LLM Gateway failure returns `Err`.
#[allow(clippy::too_many_arguments)]
async fn dispatch_task(
    deps: &PlanDeps<'_>,
    task: &Task,
    session_id: &str,
    base_ctx: &RoleContext,
    caller: &CallerContext,
    outputs: &[PlanOutputEntry],
    ephemeral: &EphemeralSecrets,
    secret_values: &[String],
) -> Result<ExecutionResult, LlmError> {
    let mut ctx = base_ctx.clone();
    ctx.current_task_detail = Some(task.detail.clone());
    ctx.current_task_expect = task.expect.clone();
    ctx.preceding_plan_outputs = outputs.to_vec();

    match task.task_type {
        TaskType::Exec => {
            let prompt = deps.templates.load(PipelineRole::ExecTranslator);
            executor::execute_exec(
                deps.gateway,
                deps.budget,
                deps.llm_config,
                &prompt,
                &ctx,
                deps.fencer,
                deps.sanitizer,
                secret_values,
                deps.access,
                &caller.user,
                deps.restricted_os_user,
                deps.workspace,
                std::time::Duration::from_secs(deps.runtime.exec_timeout_seconds),
                deps.runtime.exec_output_cap_bytes,
            )
            .await
        }
        TaskType::Skill => {
            let name = task.skill.clone().unwrap_or_default();
            let Some(installed) = deps.registry.get(&name) else {
                return Ok(ExecutionResult {
                    command: None,
                    output: format!("skill '{name}' is no longer installed"),
                    stderr: None,
                    succeeded: false,
                });
            };
            let session_secrets = ephemeral.subset(installed.manifest.session_secret_keys());
            let mut env_values: HashMap<String, String> = HashMap::new();
            for key in installed.manifest.env_keys() {
                if let Some(v) = deps.deploy_secrets.get(key).await {
                    env_values.insert(key.clone(), v.expose().to_string());
                }
            }
            Ok(executor::execute_skill(
                &installed,
                task.args.as_deref(),
                session_id,
                deps.workspace,
                session_secrets,
                outputs,
                env_values,
                deps.sanitizer,
                secret_values,
                std::time::Duration::from_secs(deps.runtime.exec_timeout_seconds),
                deps.runtime.exec_output_cap_bytes,
            )
            .await)
        }
        TaskType::Msg => {
            let prompt = deps.templates.load(PipelineRole::Messenger);
            let text = executor::execute_msg(deps.gateway, deps.budget, deps.llm_config, &prompt, &ctx, deps.fencer).await?;
            let sanitized = deps.sanitizer.sanitize(&text, secret_values.iter().map(String::as_str));
            Ok(ExecutionResult { command: None, output: sanitized, stderr: None, succeeded: true })
        }
        TaskType::Search => {
            let prompt = deps.templates.load(PipelineRole::Searcher);
            let text = executor::execute_search(deps.gateway, deps.budget, deps.llm_config, &prompt, &ctx).await?;
            let sanitized = deps.sanitizer.sanitize(&text, secret_values.iter().map(String::as_str));
            Ok(ExecutionResult { command: None, output: sanitized, stderr: None, succeeded: true })
        }
        TaskType::Replan => unreachable!("replan tasks are handled before dispatch"),
    }
}

/// Review one completed task, compensating for the reviewer's own
/// retry loop only covering parse failures: a well-formed `replan`
/// verdict with a null `reason` is retried here up to
/// `max_validation_retries` times, then synthesized (§7 "ReviewMissingReason").
async fn review_task(
    deps: &PlanDeps<'_>,
    session: &Session,
    task: &Task,
    base_ctx: &RoleContext,
    fencer: &Fencer,
    entry: &PlanOutputEntry,
) -> anyhow::Result<ReviewerOutput> {
    let mut ctx = base_ctx.clone();
    ctx.current_task_detail = Some(task.detail.clone());
    ctx.current_task_expect = task.expect.clone();
    ctx.current_task_output = Some(entry.output.clone());
    let prompt = deps.templates.load(PipelineRole::Reviewer);

    let mut attempts = 0u32;
    let mut review = invoke_reviewer_once(deps, &prompt, &ctx, fencer).await?;
    while needs_reason_retry(&review) && attempts < deps.runtime.max_validation_retries {
        attempts += 1;
        review = invoke_reviewer_once(deps, &prompt, &ctx, fencer).await?;
    }
    if needs_reason_retry(&review) {
        review.reason = Some(format!(
            "reviewer returned replan with no reason after {attempts} retries; treating as failed"
        ));
    }

    deps.audit.record(AuditEntry::Review {
        session: session.id.clone(),
        task_id: task.id,
        verdict: format!("{:?}", review.status).to_lowercase(),
        has_learning: review.learn.is_some(),
    });
    Ok(review)
}

async fn invoke_reviewer_once(
    deps: &PlanDeps<'_>,
    prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
) -> anyhow::Result<ReviewerOutput> {
    let (output, _completion) = roles::invoke_reviewer(
        deps.gateway,
        deps.budget,
        deps.llm_config,
        prompt,
        ctx,
        fencer,
        deps.runtime.max_validation_retries,
    )
    .await?;
    Ok(output)
}

/// Whether a reviewer verdict is the syntactically-valid-but-semantically-
/// incomplete case `invoke_reviewer`'s own retry loop does not catch.
fn needs_reason_retry(review: &ReviewerOutput) -> bool {
    review.status == ReviewerVerdict::Replan && review.reason.is_none()
}

/// Deliver one completed `msg` task's output to the session's webhook, if
/// configured (§4.4: "for every `msg` task that reaches `done`"). `final_`
/// is true iff this is the last `msg` in the plan and every preceding task
/// succeeded, per §4.4's delivery-order invariant.
async fn deliver_final_message(deps: &PlanDeps<'_>, session_id: &str, task_id: i64, content: &str, final_: bool) {
    let Some(session) = deps.store.get_session(session_id).await.ok().flatten() else {
        return;
    };
    let Some(webhook_url) = session.webhook else {
        return;
    };
    let payload = WebhookPayload::new(session_id, task_id, content, final_);
    egress::deliver(deps.http_client, &webhook_url, &payload, deps.audit).await;
}

/// Build the text for a worker-emitted cancel-summary `msg` (§4.2 step 7,
/// E2E scenario 3: "exactly one synthesised `msg` delivered listing the
/// one completed task").
fn synthesize_cancel_summary(completed: &[PlanOutputEntry]) -> String {
    if completed.is_empty() {
        return "This request was cancelled before any task completed.".to_string();
    }
    let lines: Vec<String> = completed
        .iter()
        .map(|e| format!("- [{}] {} -> {}", e.index, e.detail, e.output))
        .collect();
    format!(
        "This request was cancelled. {} task(s) had already completed:\n{}",
        completed.len(),
        lines.join("\n")
    )
}

/// Persist and (if a webhook is configured) deliver a worker-generated
/// `msg` that is not itself a planner-authored task — the cancel-summary
/// and replan-notification messages of §4.2. Stored as an ordinary `Msg`
/// task row appended to `plan_id` (already `done` on insert) purely so
/// `/status` can surface it; conceptually distinct from the plan's own
/// task list per §9's open-question decision.
async fn deliver_synthetic_msg(
    deps: &PlanDeps<'_>,
    session_id: &str,
    plan_id: i64,
    content: &str,
    final_: bool,
) -> anyhow::Result<()> {
    let existing = deps.store.tasks_for_plan(plan_id).await?;
    let next_index = u32::try_from(existing.len() + 1).unwrap_or(u32::MAX);
    let ids = deps
        .store
        .insert_tasks(
            plan_id,
            &[NewTask {
                index: next_index,
                task_type: TaskType::Msg,
                detail: "worker-generated notification",
                skill: None,
                args: None,
                expect: None,
            }],
        )
        .await?;
    let Some(&task_id) = ids.first() else {
        return Ok(());
    };
    deps.store.finish_task(task_id, TaskStatus::Done, Some(content), None).await?;

    let Some(session) = deps.store.get_session(session_id).await? else {
        return Ok(());
    };
    let Some(webhook_url) = session.webhook else {
        return Ok(());
    };
    let payload = WebhookPayload::new(session_id, task_id, content, final_);
    egress::deliver(deps.http_client, &webhook_url, &payload, deps.audit).await;
    Ok(())
}

async fn session_cancelled(store: &Store, session_id: &str) -> anyhow::Result<bool> {
    Ok(store.get_session(session_id).await?.map(|s| s.cancel_requested).unwrap_or(false))
}

async fn collect_secret_values(deploy: &DeploySecrets, ephemeral: &EphemeralSecrets) -> Vec<String> {
    let mut values: Vec<String> =
        deploy.snapshot().await.into_iter().map(|v| v.expose().to_string()).collect();
    values.extend(ephemeral.values().map(str::to_string));
    values
}

fn policy_failure_reason(err: &PolicyError) -> String {
    match err {
        PolicyError::RoleDowngraded { user } => {
            format!("caller '{user}' was downgraded to a role that no longer permits this task")
        }
        PolicyError::SkillRevoked { user, skill } => {
            format!("caller '{user}' no longer has access to skill '{skill}'")
        }
        PolicyError::DestructiveCommand { matched_pattern } => {
            format!("command refused: matches destructive pattern '{matched_pattern}'")
        }
    }
}

fn task_type_label(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Exec => "exec",
        TaskType::Skill => "skill",
        TaskType::Msg => "msg",
        TaskType::Search => "search",
        TaskType::Replan => "replan",
    }
}

fn task_status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Done => "done",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(status: ReviewerVerdict, reason: Option<&str>) -> ReviewerOutput {
        ReviewerOutput { status, reason: reason.map(str::to_string), learn: None }
    }

    #[test]
    fn test_needs_reason_retry_true_only_for_reasonless_replan() {
        assert!(needs_reason_retry(&verdict(ReviewerVerdict::Replan, None)));
        assert!(!needs_reason_retry(&verdict(ReviewerVerdict::Replan, Some("because"))));
        assert!(!needs_reason_retry(&verdict(ReviewerVerdict::Ok, None)));
    }

    #[test]
    fn test_task_type_labels_are_lowercase() {
        assert_eq!(task_type_label(TaskType::Exec), "exec");
        assert_eq!(task_type_label(TaskType::Replan), "replan");
    }

    #[test]
    fn test_task_status_labels_are_lowercase() {
        assert_eq!(task_status_label(TaskStatus::Done), "done");
        assert_eq!(task_status_label(TaskStatus::Failed), "failed");
    }

    #[test]
    fn test_synthesize_cancel_summary_empty_completed() {
        let summary = synthesize_cancel_summary(&[]);
        assert!(summary.contains("cancelled before any task completed"));
    }

    #[test]
    fn test_synthesize_cancel_summary_lists_completed_tasks() {
        let completed = vec![PlanOutputEntry {
            index: 1,
            task_type: TaskType::Exec,
            detail: "list files".to_string(),
            output: "a.py\nb.py".to_string(),
            status: TaskStatus::Done,
        }];
        let summary = synthesize_cancel_summary(&completed);
        assert!(summary.contains("1 task(s)"));
        assert!(summary.contains("list files"));
        assert!(summary.contains("a.py"));
    }

    #[tokio::test]
    async fn test_deliver_synthetic_msg_persists_done_task_without_webhook() {
        let store = Store::open_in_memory().await.unwrap();
        store.ensure_session("s1", None, None).await.unwrap();
        let mid = store.insert_message("s1", "alice", crate::types::MessageRole::User, "go", true).await.unwrap();
        let plan_id = store.create_plan("s1", mid, "go", None).await.unwrap();
        store
            .insert_tasks(
                plan_id,
                &[NewTask {
                    index: 1,
                    task_type: TaskType::Exec,
                    detail: "a",
                    skill: None,
                    args: None,
                    expect: Some("x"),
                }],
            )
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let audit_dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(audit_dir.path());
        deps_for_synthetic_msg_test(&store, &client, &audit, |deps| async move {
            deliver_synthetic_msg(&deps, "s1", plan_id, "cancelled, one task done", false)
                .await
                .unwrap();
        })
        .await;

        let tasks = store.tasks_for_plan(plan_id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].task_type, TaskType::Msg);
        assert_eq!(tasks[1].status, TaskStatus::Done);
        assert_eq!(tasks[1].output.as_deref(), Some("cancelled, one task done"));
    }

    /// Minimal `PlanDeps` wiring for exercising `deliver_synthetic_msg` in
    /// isolation, since the full struct needs one reference per component.
    async fn deps_for_synthetic_msg_test<F, Fut>(
        store: &Store,
        client: &reqwest::Client,
        audit: &AuditLog,
        f: F,
    ) where
        F: FnOnce(PlanDeps<'_>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        struct UnusedProvider;
        #[async_trait::async_trait]
        impl crate::llm::InferenceProvider for UnusedProvider {
            async fn complete(
                &self,
                _model: &str,
                _messages: &[crate::llm::LlmMessage],
                _max_tokens: u32,
                _schema: Option<&serde_json::Value>,
            ) -> Result<crate::llm::Completion, LlmError> {
                unreachable!("this test never invokes the LLM gateway")
            }
        }
        let gateway =
            crate::llm::LlmGateway::new(std::sync::Arc::new(UnusedProvider), None, None);
        let budget = MessageBudget::new(10);
        let llm_config = LlmConfig::default();
        let runtime = RuntimeConfig::default();
        let budget_config = BudgetConfig::default();
        let access = AccessConfig { users: HashMap::new() };
        let registry = SkillRegistry::new(std::path::PathBuf::from("/nonexistent"));
        let templates = TemplateRegistry::new(std::path::PathBuf::from("/nonexistent"));
        let fencer = Fencer::new();
        let sanitizer = Sanitizer::new();
        let deploy_secrets = DeploySecrets::new();
        let workspace = std::env::temp_dir();
        let deps = PlanDeps {
            store,
            gateway: &gateway,
            budget: &budget,
            llm_config: &llm_config,
            runtime: &runtime,
            budget_config: &budget_config,
            access: &access,
            registry: &registry,
            templates: &templates,
            fencer: &fencer,
            sanitizer: &sanitizer,
            audit,
            deploy_secrets: &deploy_secrets,
            http_client: client,
            workspace: &workspace,
            restricted_os_user: "kiso-sandbox",
        };
        f(deps).await;
    }
}
