//! Read-only context snapshots for role prompt assembly (§4.7).
//!
//! One `RoleContext` shape serves every role; each role's builder
//! function populates only the pieces that role's table row calls for,
//! and each role's `assemble_context` renders only the pieces it finds
//! populated. Keeping this a plain data struct (no I/O, no hidden
//! globals) means role pipelines can be unit-tested against fixed
//! contexts without a live store or LLM.

use crate::config::Role as AccessRole;
use crate::sanitizer::{FenceLabel, Fencer};
use crate::types::{Fact, Learning, PendingItem, PlanOutputEntry};

/// One replan attempt's `{goal, reason}`, threaded into planner context on
/// a replan call.
#[derive(Debug, Clone)]
pub struct ReplanHistoryEntry {
    pub goal: String,
    pub reason: String,
}

/// The failing task and the reviewer's reason, supplied to the planner on
/// a replan call.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub task_detail: String,
    pub reason: String,
}

/// Everything a role *might* need; each builder populates only its
/// row of the §4.7 table.
#[derive(Debug, Clone, Default)]
pub struct RoleContext {
    pub session_summary: Option<String>,
    pub recent_trusted_messages: Vec<String>,
    pub recent_msg_outputs: Vec<String>,
    pub paraphrased_untrusted: Vec<String>,
    pub new_message: Option<String>,
    pub facts: Vec<Fact>,
    pub pending_items: Vec<PendingItem>,
    pub allowed_skills: Vec<(String, String, String)>, // (name, summary, args_schema_json)
    pub caller_role: Option<AccessRole>,
    pub system_environment: Option<String>,
    pub process_goal: Option<String>,
    pub preceding_plan_outputs: Vec<PlanOutputEntry>,
    pub current_task_detail: Option<String>,
    pub current_task_expect: Option<String>,
    pub current_task_output: Option<String>,
    pub original_user_request: Option<String>,
    pub messages_to_compress: Vec<(String, Option<String>)>, // (message, its msg output if any)
    pub pending_learnings: Vec<Learning>,
    pub completed_tasks: Vec<PlanOutputEntry>,
    pub remaining_tasks: Vec<String>,
    pub failure: Option<FailureContext>,
    pub replan_history: Vec<ReplanHistoryEntry>,
    pub untrusted_batch: Vec<String>,
}

impl RoleContext {
    /// Render facts as a bullet list, omitting the section entirely when
    /// empty — matching the "internal content is never fenced" rule.
    pub(super) fn render_facts(&self) -> Option<String> {
        if self.facts.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .facts
            .iter()
            .map(|f| format!("- [{:?}, confidence {:.2}] {}", f.category, f.confidence, f.content))
            .collect();
        Some(format!("## Known facts\n{}", lines.join("\n")))
    }

    pub(super) fn render_pending_items(&self) -> Option<String> {
        if self.pending_items.is_empty() {
            return None;
        }
        let lines: Vec<String> =
            self.pending_items.iter().map(|p| format!("- {}", p.question)).collect();
        Some(format!("## Open questions\n{}", lines.join("\n")))
    }

    pub(super) fn render_allowed_skills(&self) -> Option<String> {
        if self.allowed_skills.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .allowed_skills
            .iter()
            .map(|(name, summary, schema)| format!("- `{name}`: {summary}\n  args schema: {schema}"))
            .collect();
        Some(format!("## Allowed skills\n{}", lines.join("\n")))
    }

    /// Render the in-flight plan-outputs array (§4.2 "Task output
    /// chaining"), fenced as `TASK_OUTPUT` since it is externally
    /// produced by prior task executions.
    pub(super) fn render_plan_outputs(&self, fencer: &Fencer) -> Option<String> {
        if self.preceding_plan_outputs.is_empty() {
            return None;
        }
        let body = render_output_entries(&self.preceding_plan_outputs);
        Some(format!(
            "## Preceding plan outputs\n{}",
            fencer.fence(FenceLabel::TaskOutput, &body)
        ))
    }

    pub(super) fn render_paraphrased(&self, fencer: &Fencer) -> Option<String> {
        if self.paraphrased_untrusted.is_empty() {
            return None;
        }
        let body = self.paraphrased_untrusted.join("\n---\n");
        Some(format!(
            "## Untrusted context (paraphrased)\n{}",
            fencer.fence(FenceLabel::UntrustedCtx, &body)
        ))
    }

    pub(super) fn render_current_task_output(&self, fencer: &Fencer) -> Option<String> {
        self.current_task_output.as_ref().map(|output| {
            format!("## Task output\n{}", fencer.fence(FenceLabel::TaskOutput, output))
        })
    }

    pub(super) fn render_replan_history(&self) -> Option<String> {
        if self.replan_history.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .replan_history
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{}. goal: {} — reason: {}", i + 1, e.goal, e.reason))
            .collect();
        Some(format!("## Replan history\n{}", lines.join("\n")))
    }
}

fn render_output_entries(entries: &[PlanOutputEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "{{\"index\":{},\"type\":\"{:?}\",\"detail\":{:?},\"output\":{:?},\"status\":\"{:?}\"}}",
                e.index, e.task_type, e.detail, e.output, e.status
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
