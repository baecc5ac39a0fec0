//! LLM Gateway: a single typed entry point for every role pipeline's model
//! call, across local Ollama, OpenAI-compatible, and Anthropic providers.
//!
//! Structured-output roles (planner, reviewer, curator) pass a JSON schema
//! and get back text verified to parse as JSON; free-form roles omit the
//! schema. Every call is metered against the per-message budget before it
//! is issued.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::LlmConfig;

/// Errors surfaced by the LLM Gateway.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The underlying HTTP request to the provider failed.
    #[error("inference request failed: {0}")]
    RequestFailed(String),
    /// The requested model is not available on its provider.
    #[error("model not available: {0}")]
    ModelUnavailable(String),
    /// No provider is configured for the requested name.
    #[error("provider not configured: {0}")]
    ProviderNotFound(String),
    /// Structured output was requested but the provider's response did not
    /// parse as JSON.
    #[error("structured output did not parse as JSON: {0}")]
    MalformedStructuredOutput(String),
    /// Per-message LLM call budget exhausted.
    #[error("LLM call budget exhausted ({limit} calls)")]
    BudgetExhausted {
        /// The configured limit that was hit.
        limit: u32,
    },
    /// A structured-output role's provider/model pairing failed the
    /// startup capability probe (§7, §9).
    #[error("provider does not support structured output: {0}")]
    ProviderUnsupported(String),
}

/// One role's completed call: raw text plus token accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Response text. For structured-output calls this is guaranteed to
    /// parse as JSON.
    pub text: String,
    /// Tokens consumed by the prompt, if the provider reported them.
    pub input_tokens: i64,
    /// Tokens consumed by the completion, if the provider reported them.
    pub output_tokens: i64,
    /// The model name actually used.
    pub model: String,
}

/// A single message in a role's conversation with the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// Trait implemented by each concrete provider backend.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Issue a completion request. `schema` being `Some` asks the provider
    /// to constrain output to the given JSON schema, where supported.
    async fn complete(
        &self,
        model: &str,
        messages: &[LlmMessage],
        max_tokens: u32,
        schema: Option<&Value>,
    ) -> Result<Completion, LlmError>;
}

/// Per-message LLM call budget: an ambient counter scoped to processing
/// one inbound message, not a process-wide daily counter.
pub struct MessageBudget {
    used: AtomicU32,
    limit: u32,
}

impl MessageBudget {
    /// Construct a fresh budget for one message.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self { used: AtomicU32::new(0), limit }
    }

    /// Reserve one call slot, or fail if the budget is exhausted.
    pub fn check_and_increment(&self) -> Result<(), LlmError> {
        let previous = self.used.fetch_add(1, Ordering::SeqCst);
        if previous >= self.limit {
            return Err(LlmError::BudgetExhausted { limit: self.limit });
        }
        Ok(())
    }

    /// Number of calls made so far.
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }
}

/// The LLM Gateway: resolves a named provider and meters calls against a
/// per-message budget.
pub struct LlmGateway {
    local: Arc<dyn InferenceProvider>,
    anthropic: Option<Arc<dyn InferenceProvider>>,
    openai: Option<Arc<dyn InferenceProvider>>,
}

impl LlmConfig {
    /// Resolve the `(provider, model)` pair every role pipeline calls by
    /// default: prefer Anthropic, then OpenAI, then the always-available
    /// local Ollama backend. Kiso has no per-role routing table — all
    /// eight roles share one priority order.
    #[must_use]
    pub fn primary_route(&self) -> (&str, &str) {
        if let Some(anthropic) = &self.anthropic {
            return ("anthropic", &anthropic.model);
        }
        if let Some(openai) = &self.openai {
            return ("openai", &openai.model);
        }
        ("local", &self.local.model)
    }
}

impl LlmGateway {
    /// Build a gateway from configuration, wiring up whichever cloud
    /// providers have credentials configured. Local Ollama is always
    /// available.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        let local: Arc<dyn InferenceProvider> =
            Arc::new(OllamaProvider::new(&config.local.base_url));
        let anthropic = config
            .anthropic
            .as_ref()
            .map(|c| Arc::new(AnthropicProvider::new(&c.api_key)) as Arc<dyn InferenceProvider>);
        let openai = config.openai.as_ref().map(|c| {
            Arc::new(OpenAiProvider::new(&c.base_url, Some(&c.api_key))) as Arc<dyn InferenceProvider>
        });
        Self { local, anthropic, openai }
    }

    /// Construct directly from provider instances, for tests and fakes.
    #[must_use]
    pub fn new(
        local: Arc<dyn InferenceProvider>,
        anthropic: Option<Arc<dyn InferenceProvider>>,
        openai: Option<Arc<dyn InferenceProvider>>,
    ) -> Self {
        Self { local, anthropic, openai }
    }

    fn resolve(&self, provider: &str) -> Result<Arc<dyn InferenceProvider>, LlmError> {
        match provider {
            "local" | "ollama" => Ok(self.local.clone()),
            "anthropic" => {
                self.anthropic.clone().ok_or_else(|| LlmError::ProviderNotFound(provider.to_string()))
            }
            "openai" => {
                self.openai.clone().ok_or_else(|| LlmError::ProviderNotFound(provider.to_string()))
            }
            other => Err(LlmError::ProviderNotFound(other.to_string())),
        }
    }

    /// Issue one call, checking and incrementing `budget` first.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::BudgetExhausted`] if the per-message budget is
    /// spent, [`LlmError::ProviderNotFound`] if `provider` has no
    /// configured backend, or whatever error the backend itself returns.
    pub async fn call(
        &self,
        budget: &MessageBudget,
        provider: &str,
        model: &str,
        messages: &[LlmMessage],
        max_tokens: u32,
        schema: Option<&Value>,
    ) -> Result<Completion, LlmError> {
        budget.check_and_increment()?;
        let backend = self.resolve(provider)?;
        let completion = backend.complete(model, messages, max_tokens, schema).await?;
        if schema.is_some() {
            serde_json::from_str::<Value>(&completion.text)
                .map_err(|e| LlmError::MalformedStructuredOutput(e.to_string()))?;
        }
        Ok(completion)
    }

    /// Capability probe (§9): issue one real structured-output call against
    /// the primary route before the scheduler accepts any message, so a
    /// provider/model pairing that can't honor a JSON schema fails loudly
    /// at startup instead of surfacing as a `MalformedStructuredOutput` (or,
    /// for OpenAI's `strict` mode, an HTTP 400) on the first user message —
    /// planner, reviewer, and curator all call through this same route.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ProviderUnsupported`] if the call fails or its
    /// response doesn't parse as JSON, naming the provider/model and the
    /// roles that depend on it. Returns [`LlmError::ProviderNotFound`] if
    /// `llm_config`'s primary route names a backend this gateway has none
    /// configured for.
    pub async fn probe_structured_output(&self, llm_config: &LlmConfig) -> Result<(), LlmError> {
        let (provider, model) = llm_config.primary_route();
        let backend = self.resolve(provider)?;
        let schema = serde_json::json!({
            "type": "object",
            "required": ["ok"],
            "additionalProperties": false,
            "properties": { "ok": { "type": "boolean" } }
        });
        let messages = [LlmMessage {
            role: "user".to_string(),
            content: r#"Reply with the JSON object {"ok": true} and nothing else."#.to_string(),
        }];
        let unsupported = |detail: String| {
            LlmError::ProviderUnsupported(format!(
                "provider '{provider}' / model '{model}' cannot satisfy the structured-output \
                 contract required by the planner, reviewer, and curator roles: {detail}"
            ))
        };
        let completion = backend
            .complete(model, &messages, 32, Some(&schema))
            .await
            .map_err(|e| unsupported(e.to_string()))?;
        serde_json::from_str::<Value>(&completion.text).map_err(|e| unsupported(e.to_string()))?;
        Ok(())
    }
}

// ── Ollama ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [LlmMessage],
    stream: bool,
    format: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: LlmMessage,
    #[serde(default)]
    prompt_eval_count: i64,
    #[serde(default)]
    eval_count: i64,
}

/// Local Ollama provider — no API key required.
pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    /// Build a provider pointed at `base_url` (e.g. `http://localhost:11434`).
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self { base_url: base_url.to_string(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[LlmMessage],
        _max_tokens: u32,
        schema: Option<&Value>,
    ) -> Result<Completion, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest { model, messages, stream: false, format: schema };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(provider_error(resp, model).await);
        }

        let parsed: OllamaChatResponse =
            resp.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        Ok(Completion {
            text: parsed.message.content,
            input_tokens: parsed.prompt_eval_count,
            output_tokens: parsed.eval_count,
            model: model.to_string(),
        })
    }
}

// ── OpenAI-compatible ────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [LlmMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat<'a>>,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: OpenAiJsonSchema<'a>,
}

#[derive(Debug, Serialize)]
struct OpenAiJsonSchema<'a> {
    name: &'static str,
    strict: bool,
    schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: LlmMessage,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

/// OpenAI or any OpenAI-compatible provider (e.g. a local server exposing
/// `/v1/chat/completions`).
pub struct OpenAiProvider {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Build a provider against `base_url`, authenticating with `api_key`
    /// if present.
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: api_key.map(str::to_string),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[LlmMessage],
        max_tokens: u32,
        schema: Option<&Value>,
    ) -> Result<Completion, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response_format = schema.map(|s| OpenAiResponseFormat {
            kind: "json_schema",
            json_schema: OpenAiJsonSchema { name: "kiso_role_output", strict: true, schema: s },
        });
        let body = OpenAiRequest { model, messages, max_tokens, response_format };

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(provider_error(resp, model).await);
        }

        let parsed: OpenAiResponse =
            resp.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let usage = parsed.usage.unwrap_or_default();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::RequestFailed("empty choices array".to_string()))?;

        Ok(Completion {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            model: model.to_string(),
        })
    }
}

// ── Anthropic ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [LlmMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool<'a> {
    name: &'static str,
    input_schema: &'a Value,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'static str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnthropicContentBlock {
    Text { text: String },
    ToolUse { input: Value },
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

/// Anthropic Messages API provider. Structured output is implemented via a
/// single forced tool call whose input schema is the requested JSON schema.
pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Build a provider authenticating with `api_key`.
    #[must_use]
    pub fn new(api_key: &str) -> Self {
        Self { api_key: api_key.to_string(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl InferenceProvider for AnthropicProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[LlmMessage],
        max_tokens: u32,
        schema: Option<&Value>,
    ) -> Result<Completion, LlmError> {
        let (tools, tool_choice) = match schema {
            Some(s) => (
                Some(vec![AnthropicTool { name: "emit_structured_output", input_schema: s }]),
                Some(AnthropicToolChoice { kind: "tool", name: "emit_structured_output" }),
            ),
            None => (None, None),
        };
        let body = AnthropicRequest { model, max_tokens, messages, tools, tool_choice };

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(provider_error(resp, model).await);
        }

        let parsed: AnthropicResponse =
            resp.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        let text = parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
                AnthropicContentBlock::ToolUse { input } => Some(input.to_string()),
            })
            .ok_or_else(|| LlmError::RequestFailed("empty content array".to_string()))?;

        Ok(Completion {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            model: model.to_string(),
        })
    }
}

async fn provider_error(resp: reqwest::Response, model: &str) -> LlmError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_else(|e| format!("(body unreadable: {e})"));
    if status.as_u16() == 404 {
        return LlmError::ModelUnavailable(model.to_string());
    }
    LlmError::RequestFailed(format!("HTTP {status}: {text}"))
}
