//! Planner role (§4.2 step 3, §4.7): decomposes a message into an ordered
//! task plan, semantically validated before it is ever persisted.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::LlmConfig;
use crate::llm::{LlmError, LlmGateway, LlmMessage, MessageBudget};
use crate::sanitizer::Fencer;
use crate::skills::{is_allowed, ArgsValidationError, SkillRegistry};
use crate::types::TaskType;

use super::context::RoleContext;
use super::parse::clean_structured_output;

/// One task as the planner emits it, before it is turned into a [`crate::types::Task`] row.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub detail: String,
    pub skill: Option<String>,
    pub args: Option<Value>,
    pub expect: Option<String>,
}

/// One ephemeral secret the planner wants held in the worker's in-memory
/// map for the remainder of this session.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSecret {
    pub key: String,
    pub value: String,
}

/// The planner's full structured response.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerOutput {
    pub goal: String,
    #[serde(default)]
    pub secrets: Option<Vec<PlannerSecret>>,
    pub tasks: Vec<PlannerTask>,
    /// Extra replan depth granted for this plan's lineage, 0..=max_extend_replan.
    #[serde(default)]
    pub extend_replan: Option<u8>,
}

/// Why a candidate [`PlannerOutput`] was rejected before persistence.
#[derive(Debug, Error, PartialEq)]
pub enum PlanValidationError {
    #[error("plan has no tasks")]
    EmptyPlan,
    #[error("task {index} ({task_type:?}) requires a non-null expect")]
    MissingExpect { index: usize, task_type: TaskType },
    #[error("task {index} ({task_type:?}) must not carry an expect")]
    UnexpectedExpect { index: usize, task_type: TaskType },
    #[error("plan must end with a msg or replan task")]
    MustEndWithMsgOrReplan,
    #[error("a replan task must be the last task and the only one in the plan")]
    ReplanMustBeLastAndUnique,
    #[error("a replan task must not carry a skill or args")]
    ReplanHasSkillOrArgs,
    #[error("task {index} references unknown skill '{name}'")]
    UnknownSkill { index: usize, name: String },
    #[error("task {index} references skill '{name}' not in this caller's allowed-skills list")]
    SkillNotAllowed { index: usize, name: String },
    #[error("task {index} skill '{name}' args invalid: {source}")]
    InvalidArgs { index: usize, name: String, source: ArgsValidationError },
    #[error("task {index} ({task_type:?}) declares a skill but is not a skill task")]
    SkillOnNonSkillTask { index: usize, task_type: TaskType },
    #[error("response did not parse as a plan: {0}")]
    MalformedJson(String),
}

/// Validate a candidate plan's tasks against the structural invariants
/// (§4.2) and the caller's skill allow-list.
///
/// `allowed_skills` of `None` means the caller is an admin: every
/// installed skill is reachable regardless of its configured allow-list.
pub fn validate_plan(
    tasks: &[PlannerTask],
    registry: &SkillRegistry,
    allowed_skills: Option<&[String]>,
) -> Result<(), PlanValidationError> {
    if tasks.is_empty() {
        return Err(PlanValidationError::EmptyPlan);
    }

    for (index, task) in tasks.iter().enumerate() {
        let has_expect = task.expect.is_some();
        if task.task_type.requires_expect() && !has_expect {
            return Err(PlanValidationError::MissingExpect { index, task_type: task.task_type });
        }
        if !task.task_type.requires_expect() && has_expect {
            return Err(PlanValidationError::UnexpectedExpect { index, task_type: task.task_type });
        }

        if task.task_type == TaskType::Skill {
            let name = task.skill.clone().unwrap_or_default();
            let manifest = registry.get(&name).ok_or_else(|| PlanValidationError::UnknownSkill {
                index,
                name: name.clone(),
            })?;
            if let Some(allowed) = allowed_skills {
                if !is_allowed(&name, allowed) {
                    return Err(PlanValidationError::SkillNotAllowed { index, name: name.clone() });
                }
            }
            let args_json = task.args.as_ref().map(|v| v.to_string());
            manifest
                .manifest
                .validate_args(args_json.as_deref())
                .map_err(|source| PlanValidationError::InvalidArgs { index, name, source })?;
        } else if task.skill.is_some() {
            return Err(PlanValidationError::SkillOnNonSkillTask { index, task_type: task.task_type });
        }
    }

    let replan_positions: Vec<usize> =
        tasks.iter().enumerate().filter(|(_, t)| t.task_type == TaskType::Replan).map(|(i, _)| i).collect();
    match replan_positions.as_slice() {
        [] => {}
        [only] if *only == tasks.len() - 1 => {
            let replan = &tasks[*only];
            if replan.skill.is_some() || replan.args.is_some() {
                return Err(PlanValidationError::ReplanHasSkillOrArgs);
            }
        }
        _ => return Err(PlanValidationError::ReplanMustBeLastAndUnique),
    }

    let last = &tasks[tasks.len() - 1];
    if !matches!(last.task_type, TaskType::Msg | TaskType::Replan) {
        return Err(PlanValidationError::MustEndWithMsgOrReplan);
    }

    Ok(())
}

/// Errors surfaced by [`invoke_planner`].
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("planner response did not parse: {0}")]
    Parse(String),
    #[error("planner produced an invalid plan after {retries} retries: {last}")]
    ValidationRetriesExhausted { retries: u32, last: PlanValidationError },
}

/// JSON schema the planner's structured output is constrained to.
///
/// §4.5: "All schemas use `additionalProperties: false` and mark every
/// property required (optionals are nullable types)" — OpenAI's `strict`
/// `json_schema` mode (`src/llm/mod.rs`) enforces this at the transport
/// level, rejecting any schema that omits either, so every object here
/// (including nested `secrets`/`tasks` items) lists every key of its
/// `properties` in `required` and sets `additionalProperties: false`.
fn schema() -> Value {
    json!({
        "type": "object",
        "required": ["goal", "secrets", "tasks", "extend_replan"],
        "additionalProperties": false,
        "properties": {
            "goal": { "type": "string" },
            "secrets": {
                "type": ["array", "null"],
                "items": {
                    "type": "object",
                    "required": ["key", "value"],
                    "additionalProperties": false,
                    "properties": { "key": { "type": "string" }, "value": { "type": "string" } }
                }
            },
            "tasks": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["type", "detail", "skill", "args", "expect"],
                    "additionalProperties": false,
                    "properties": {
                        "type": { "type": "string", "enum": ["exec", "skill", "msg", "search", "replan"] },
                        "detail": { "type": "string" },
                        "skill": { "type": ["string", "null"] },
                        "args": { "type": ["object", "null"] },
                        "expect": { "type": ["string", "null"] }
                    }
                }
            },
            "extend_replan": { "type": ["integer", "null"] }
        }
    })
}

/// Assemble the planner's user-turn context from a populated [`RoleContext`].
#[must_use]
pub fn assemble_context(ctx: &RoleContext, fencer: &Fencer) -> String {
    let mut sections = Vec::new();
    if let Some(goal) = &ctx.process_goal {
        sections.push(format!("## Process goal\n{goal}"));
    }
    if let Some(env) = &ctx.system_environment {
        sections.push(format!("## System environment\n{env}"));
    }
    if let Some(summary) = &ctx.session_summary {
        sections.push(format!("## Session summary\n{summary}"));
    }
    if !ctx.recent_trusted_messages.is_empty() {
        sections.push(format!(
            "## Recent conversation\n{}",
            ctx.recent_trusted_messages.join("\n")
        ));
    }
    if let Some(facts) = ctx.render_facts() {
        sections.push(facts);
    }
    if let Some(pending) = ctx.render_pending_items() {
        sections.push(pending);
    }
    if let Some(skills) = ctx.render_allowed_skills() {
        sections.push(skills);
    }
    if let Some(outputs) = ctx.render_plan_outputs(fencer) {
        sections.push(outputs);
    }
    if let Some(paraphrased) = ctx.render_paraphrased(fencer) {
        sections.push(paraphrased);
    }
    if let Some(history) = ctx.render_replan_history() {
        sections.push(history);
    }
    if let Some(failure) = &ctx.failure {
        sections.push(format!(
            "## Failure driving this replan\nTask: {}\nReason: {}",
            failure.task_detail, failure.reason
        ));
    }
    if let Some(new_message) = &ctx.new_message {
        sections.push(format!("## New message\n{new_message}"));
    }
    sections.join("\n\n")
}

/// Call the planner, retrying up to `max_retries` times on a validation
/// failure (appending the rejection reason to the prompt each time) before
/// giving up.
#[allow(clippy::too_many_arguments)]
pub async fn invoke_planner(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
    registry: &SkillRegistry,
    allowed_skills: Option<&[String]>,
    max_retries: u32,
) -> Result<(PlannerOutput, Completion), PlannerError> {
    let (provider, model) = llm_config.primary_route();
    let schema = schema();
    let base_context = assemble_context(ctx, fencer);
    let mut last_error = None;

    for attempt in 0..=max_retries {
        let mut user_content = base_context.clone();
        if let Some(err) = &last_error {
            user_content.push_str(&format!(
                "\n\n## Previous attempt rejected\n{err}\nProduce a corrected plan."
            ));
        }
        let messages = [
            LlmMessage { role: "system".to_string(), content: system_prompt.to_string() },
            LlmMessage { role: "user".to_string(), content: user_content },
        ];
        let completion =
            gateway.call(budget, provider, model, &messages, 4096, Some(&schema)).await?;
        let cleaned = clean_structured_output(&completion.text);
        let parsed: PlannerOutput = match serde_json::from_str(cleaned) {
            Ok(p) => p,
            Err(e) => {
                if attempt == max_retries {
                    return Err(PlannerError::Parse(e.to_string()));
                }
                last_error = Some(PlanValidationError::MalformedJson(e.to_string()));
                continue;
            }
        };
        match validate_plan(&parsed.tasks, registry, allowed_skills) {
            Ok(()) => return Ok((parsed, completion)),
            Err(e) => {
                if attempt == max_retries {
                    return Err(PlannerError::ValidationRetriesExhausted { retries: max_retries, last: e });
                }
                last_error = Some(e);
            }
        }
    }
    unreachable!("loop always returns by the final iteration")
}

/// Re-exported for callers that need token accounting alongside the parsed output.
pub use crate::llm::Completion;
