//! Reviewer role (§4.2 step 8, §4.7): judges one completed task's output
//! against its declared `expect`, optionally emitting a durable learning.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::LlmConfig;
use crate::llm::{Completion, LlmError, LlmGateway, LlmMessage, MessageBudget};
use crate::sanitizer::Fencer;

use super::context::RoleContext;
use super::parse::clean_structured_output;

/// The reviewer's verdict on one completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerVerdict {
    Ok,
    Replan,
}

/// The reviewer's full structured response.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewerOutput {
    pub status: ReviewerVerdict,
    /// Required when `status` is `replan`; a planner-facing description of
    /// what went wrong.
    #[serde(default)]
    pub reason: Option<String>,
    /// A durable, generalizable fact worth promoting via the curator.
    #[serde(default)]
    pub learn: Option<String>,
}

/// Errors surfaced by [`invoke_reviewer`].
#[derive(Debug, Error)]
pub enum ReviewerError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("reviewer response did not parse after {retries} retries: {last}")]
    ParseRetriesExhausted { retries: u32, last: String },
}

/// §4.5: every property required (nullable types for optionals),
/// `additionalProperties: false` — see the longer note on the planner's
/// `schema()` for why this is load-bearing, not cosmetic.
fn schema() -> Value {
    json!({
        "type": "object",
        "required": ["status", "reason", "learn"],
        "additionalProperties": false,
        "properties": {
            "status": { "type": "string", "enum": ["ok", "replan"] },
            "reason": { "type": ["string", "null"] },
            "learn": { "type": ["string", "null"] }
        }
    })
}

/// Assemble the reviewer's user-turn context: the task's detail, its
/// `expect`, and its output, fenced as untrusted.
#[must_use]
pub fn assemble_context(ctx: &RoleContext, fencer: &Fencer) -> String {
    let mut sections = Vec::new();
    if let Some(detail) = &ctx.current_task_detail {
        sections.push(format!("## Task\n{detail}"));
    }
    if let Some(expect) = &ctx.current_task_expect {
        sections.push(format!("## Expected outcome\n{expect}"));
    }
    if let Some(output) = ctx.render_current_task_output(fencer) {
        sections.push(output);
    }
    if let Some(facts) = ctx.render_facts() {
        sections.push(facts);
    }
    sections.join("\n\n")
}

/// Call the reviewer. On a malformed response, retries up to `max_retries`
/// times; if every attempt fails to parse, synthesizes a `replan` verdict
/// whose reason records the parse failure rather than surfacing a hard
/// error up the plan runtime (a broken reviewer should still make
/// progress, not wedge the plan).
pub async fn invoke_reviewer(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
    max_retries: u32,
) -> Result<(ReviewerOutput, Completion), ReviewerError> {
    let (provider, model) = llm_config.primary_route();
    let schema = schema();
    let user_content = assemble_context(ctx, fencer);
    let messages = [
        LlmMessage { role: "system".to_string(), content: system_prompt.to_string() },
        LlmMessage { role: "user".to_string(), content: user_content },
    ];

    let mut last_error = String::new();
    for attempt in 0..=max_retries {
        let completion =
            gateway.call(budget, provider, model, &messages, 1024, Some(&schema)).await?;
        let cleaned = clean_structured_output(&completion.text);
        match serde_json::from_str::<ReviewerOutput>(cleaned) {
            Ok(parsed) => return Ok((parsed, completion)),
            Err(e) => last_error = e.to_string(),
        }
        if attempt == max_retries {
            let synthesized = ReviewerOutput {
                status: ReviewerVerdict::Replan,
                reason: Some(format!(
                    "reviewer produced unparseable output after {} attempts: {last_error}",
                    max_retries + 1
                )),
                learn: None,
            };
            return Ok((synthesized, completion));
        }
    }
    Err(ReviewerError::ParseRetriesExhausted { retries: max_retries, last: last_error })
}
