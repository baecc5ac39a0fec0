//! Free-form role pipelines: messenger, searcher, summarizer, paraphraser,
//! exec translator. None of these use structured output — each returns
//! plain text (or, for the summarizer's fact-consolidation mode, a JSON
//! array parsed separately from the schema-enforced roles).

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::llm::{Completion, LlmError, LlmGateway, LlmMessage, MessageBudget};
use crate::sanitizer::Fencer;
use crate::types::FactCategory;

use super::context::RoleContext;
use super::parse::clean_structured_output;

/// Errors surfaced by any free-form role call.
#[derive(Debug, Error)]
pub enum FreeFormError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("summarizer fact-consolidation response did not parse: {0}")]
    ParseFacts(String),
}

async fn call_free_form(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    user_content: String,
    max_tokens: u32,
) -> Result<Completion, LlmError> {
    let (provider, model) = llm_config.primary_route();
    let messages = [
        LlmMessage { role: "system".to_string(), content: system_prompt.to_string() },
        LlmMessage { role: "user".to_string(), content: user_content },
    ];
    gateway.call(budget, provider, model, &messages, max_tokens, None).await
}

/// Compose the message to deliver for a `msg` task. The messenger sees no
/// conversation history beyond what `ctx` carries — only the task detail
/// and the facts/summary/plan-outputs context.
pub async fn invoke_messenger(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
) -> Result<Completion, LlmError> {
    let mut sections = Vec::new();
    if let Some(detail) = &ctx.current_task_detail {
        sections.push(format!("## Task\n{detail}"));
    }
    if let Some(summary) = &ctx.session_summary {
        sections.push(format!("## Session summary\n{summary}"));
    }
    if let Some(facts) = ctx.render_facts() {
        sections.push(facts);
    }
    if let Some(outputs) = ctx.render_plan_outputs(fencer) {
        sections.push(outputs);
    }
    call_free_form(gateway, budget, llm_config, system_prompt, sections.join("\n\n"), 2048).await
}

/// Perform a web search for the task's query and produce a concise digest.
pub async fn invoke_searcher(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
) -> Result<Completion, LlmError> {
    let query = ctx.current_task_detail.clone().unwrap_or_default();
    call_free_form(gateway, budget, llm_config, system_prompt, format!("## Query\n{query}"), 2048).await
}

/// Rewrite a batch of untrusted inbound messages as neutral third-person
/// descriptions, stripping any embedded instructions.
pub async fn invoke_paraphraser(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
) -> Result<Completion, LlmError> {
    let batch = ctx.untrusted_batch.join("\n---\n");
    let fenced = fencer.fence(crate::sanitizer::FenceLabel::ExternalContext, &batch);
    call_free_form(
        gateway,
        budget,
        llm_config,
        system_prompt,
        format!("## Messages to paraphrase\n{fenced}"),
        2048,
    )
    .await
}

/// Translate a task's detail into a shell command, or the `CANNOT_TRANSLATE`
/// sentinel when no safe unambiguous command exists.
#[derive(Debug, Clone)]
pub enum ExecTranslation {
    Command(String),
    CannotTranslate,
}

/// Translate one `exec` task's detail into a shell command.
pub async fn invoke_exec_translator(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
) -> Result<(ExecTranslation, Completion), LlmError> {
    let mut sections = Vec::new();
    if let Some(detail) = &ctx.current_task_detail {
        sections.push(format!("## Task\n{detail}"));
    }
    if let Some(env) = &ctx.system_environment {
        sections.push(format!("## System environment\n{env}"));
    }
    if let Some(outputs) = ctx.render_plan_outputs(fencer) {
        sections.push(outputs);
    }
    let completion =
        call_free_form(gateway, budget, llm_config, system_prompt, sections.join("\n\n"), 512).await?;
    let trimmed = completion.text.trim();
    let translation = if trimmed == "CANNOT_TRANSLATE" {
        ExecTranslation::CannotTranslate
    } else {
        ExecTranslation::Command(trimmed.to_string())
    };
    Ok((translation, completion))
}

/// One consolidated fact, as the summarizer emits it during fact
/// consolidation (§4.6 step 4).
#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidatedFact {
    pub content: String,
    pub category: FactCategory,
    pub confidence: f64,
}

/// Rewrite the rolling session summary from a batch of older messages (and
/// their `msg` outputs), producing the four canonical sections.
pub async fn invoke_summarizer_rewrite(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
) -> Result<Completion, LlmError> {
    let mut sections = Vec::new();
    if let Some(summary) = &ctx.session_summary {
        sections.push(format!("## Current summary\n{summary}"));
    }
    if !ctx.messages_to_compress.is_empty() {
        let lines: Vec<String> = ctx
            .messages_to_compress
            .iter()
            .map(|(message, output)| match output {
                Some(output) => format!("- {message}\n  -> {output}"),
                None => format!("- {message}"),
            })
            .collect();
        sections.push(format!("## Messages to fold in\n{}", lines.join("\n")));
    }
    call_free_form(gateway, budget, llm_config, system_prompt, sections.join("\n\n"), 2048).await
}

/// Consolidate the full current fact list into a smaller, higher-quality
/// set. Returns the parsed array alongside the raw completion for audit.
pub async fn invoke_summarizer_consolidate(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
) -> Result<(Vec<ConsolidatedFact>, Completion), FreeFormError> {
    let facts_section = ctx.render_facts().unwrap_or_else(|| "## Known facts\n(none)".to_string());
    let instructions = format!(
        "{facts_section}\n\nRespond with a JSON array only, matching {}.",
        json!([{ "content": "string", "category": "project|user|tool|general", "confidence": 0.0 }])
    );
    let completion =
        call_free_form(gateway, budget, llm_config, system_prompt, instructions, 4096).await?;
    let cleaned = clean_structured_output(&completion.text);
    let parsed: Vec<ConsolidatedFact> =
        serde_json::from_str(cleaned).map_err(|e| FreeFormError::ParseFacts(e.to_string()))?;
    Ok((parsed, completion))
}

/// Dispatches either summarizer mode, matching this module's shared
/// `invoke_*` naming so [`super`] can re-export one symbol per mode.
pub async fn invoke_summarizer(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
) -> Result<Completion, LlmError> {
    invoke_summarizer_rewrite(gateway, budget, llm_config, system_prompt, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    use crate::llm::InferenceProvider;

    struct FixedProvider {
        text: String,
    }

    #[async_trait]
    impl InferenceProvider for FixedProvider {
        async fn complete(
            &self,
            model: &str,
            _messages: &[LlmMessage],
            _max_tokens: u32,
            _schema: Option<&Value>,
        ) -> Result<Completion, LlmError> {
            Ok(Completion {
                text: self.text.clone(),
                input_tokens: 1,
                output_tokens: 1,
                model: model.to_string(),
            })
        }
    }

    fn gateway(text: &str) -> LlmGateway {
        let provider: Arc<dyn InferenceProvider> = Arc::new(FixedProvider { text: text.to_string() });
        LlmGateway::new(provider, None, None)
    }

    #[tokio::test]
    async fn test_exec_translator_detects_cannot_translate_sentinel() {
        let gw = gateway("CANNOT_TRANSLATE");
        let budget = MessageBudget::new(10);
        let config = LlmConfig::default();
        let ctx = RoleContext::default();
        let fencer = Fencer::new();
        let (translation, _) =
            invoke_exec_translator(&gw, &budget, &config, "prompt", &ctx, &fencer).await.unwrap();
        assert!(matches!(translation, ExecTranslation::CannotTranslate));
    }

    #[tokio::test]
    async fn test_exec_translator_returns_command_text() {
        let gw = gateway("ls -la /tmp");
        let budget = MessageBudget::new(10);
        let config = LlmConfig::default();
        let ctx = RoleContext::default();
        let fencer = Fencer::new();
        let (translation, _) =
            invoke_exec_translator(&gw, &budget, &config, "prompt", &ctx, &fencer).await.unwrap();
        match translation {
            ExecTranslation::Command(cmd) => assert_eq!(cmd, "ls -la /tmp"),
            ExecTranslation::CannotTranslate => panic!("expected a command"),
        }
    }

    #[tokio::test]
    async fn test_summarizer_consolidate_parses_fact_array() {
        let gw = gateway(r#"[{"content":"host lacks curl","category":"tool","confidence":0.9}]"#);
        let budget = MessageBudget::new(10);
        let config = LlmConfig::default();
        let ctx = RoleContext::default();
        let (facts, _) =
            invoke_summarizer_consolidate(&gw, &budget, &config, "prompt", &ctx).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].category, FactCategory::Tool);
    }

    #[tokio::test]
    async fn test_messenger_includes_task_detail_in_prompt() {
        let gw = gateway("delivered");
        let budget = MessageBudget::new(10);
        let config = LlmConfig::default();
        let mut ctx = RoleContext::default();
        ctx.current_task_detail = Some("tell the user it's done".to_string());
        let fencer = Fencer::new();
        let completion =
            invoke_messenger(&gw, &budget, &config, "prompt", &ctx, &fencer).await.unwrap();
        assert_eq!(completion.text, "delivered");
    }
}
