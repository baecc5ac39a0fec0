//! Curator role (§4.6 step 2): disposes of pending learnings emitted by
//! the reviewer — promote to a durable fact, ask an operator, or discard.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::LlmConfig;
use crate::llm::{Completion, LlmError, LlmGateway, LlmMessage, MessageBudget};
use crate::types::FactCategory;

use super::context::RoleContext;
use super::parse::clean_structured_output;

/// The curator's disposition for one pending learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CuratorVerdict {
    Promote,
    Ask,
    Discard,
}

/// A fact as the curator emits it on a `promote` verdict.
#[derive(Debug, Clone, Deserialize)]
pub struct CuratorFact {
    pub content: String,
    pub category: FactCategory,
}

/// One learning's disposition.
#[derive(Debug, Clone, Deserialize)]
pub struct CuratorEvaluation {
    pub learning_id: i64,
    pub verdict: CuratorVerdict,
    #[serde(default)]
    pub fact: Option<CuratorFact>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The curator's full structured response: one evaluation per pending
/// learning it was given.
#[derive(Debug, Clone, Deserialize)]
pub struct CuratorOutput {
    pub evaluations: Vec<CuratorEvaluation>,
}

/// Errors surfaced by [`invoke_curator`].
#[derive(Debug, Error)]
pub enum CuratorError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("curator response did not parse: {0}")]
    Parse(String),
}

/// §4.5: every property required (nullable types for optionals),
/// `additionalProperties: false` on every object, including the nested
/// `fact` object — see the longer note on the planner's `schema()` for why
/// this is load-bearing, not cosmetic.
fn schema() -> Value {
    json!({
        "type": "object",
        "required": ["evaluations"],
        "additionalProperties": false,
        "properties": {
            "evaluations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["learning_id", "verdict", "fact", "question", "reason"],
                    "additionalProperties": false,
                    "properties": {
                        "learning_id": { "type": "integer" },
                        "verdict": { "type": "string", "enum": ["promote", "ask", "discard"] },
                        "fact": {
                            "type": ["object", "null"],
                            "required": ["content", "category"],
                            "additionalProperties": false,
                            "properties": {
                                "content": { "type": "string" },
                                "category": {
                                    "type": "string",
                                    "enum": ["project", "user", "tool", "general"]
                                }
                            }
                        },
                        "question": { "type": ["string", "null"] },
                        "reason": { "type": ["string", "null"] }
                    }
                }
            }
        }
    })
}

/// Assemble the curator's user-turn context: pending learnings plus the
/// existing fact and pending-item records they should be checked against.
#[must_use]
pub fn assemble_context(ctx: &RoleContext) -> String {
    let mut sections = Vec::new();
    if !ctx.pending_learnings.is_empty() {
        let lines: Vec<String> = ctx
            .pending_learnings
            .iter()
            .map(|l| format!("- [id {}] {}", l.id, l.content))
            .collect();
        sections.push(format!("## Pending learnings\n{}", lines.join("\n")));
    }
    if let Some(facts) = ctx.render_facts() {
        sections.push(facts);
    }
    if let Some(pending) = ctx.render_pending_items() {
        sections.push(pending);
    }
    sections.join("\n\n")
}

/// Call the curator with the learnings already populated on `ctx`. Returns
/// `Ok(None)` without issuing a call if there is nothing to evaluate.
pub async fn invoke_curator(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
) -> Result<Option<(CuratorOutput, Completion)>, CuratorError> {
    if ctx.pending_learnings.is_empty() {
        return Ok(None);
    }
    let (provider, model) = llm_config.primary_route();
    let schema = schema();
    let user_content = assemble_context(ctx);
    let messages = [
        LlmMessage { role: "system".to_string(), content: system_prompt.to_string() },
        LlmMessage { role: "user".to_string(), content: user_content },
    ];
    let completion = gateway.call(budget, provider, model, &messages, 2048, Some(&schema)).await?;
    let cleaned = clean_structured_output(&completion.text);
    let parsed: CuratorOutput =
        serde_json::from_str(cleaned).map_err(|e| CuratorError::Parse(e.to_string()))?;
    Ok(Some((parsed, completion)))
}
