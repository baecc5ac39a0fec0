//! Configuration loading and management.
//!
//! Loads Kiso configuration from `./config.toml` (or `$KISO_CONFIG_PATH`).
//! Environment variables override file values; file values override
//! defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level Kiso configuration loaded from TOML.
///
/// Path: `./config.toml` or `$KISO_CONFIG_PATH`. Env vars override file
/// values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KisoConfig {
    /// Scheduler and session worker settings.
    pub runtime: RuntimeConfig,
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
    /// LLM provider configuration.
    pub llm: LlmConfig,
    /// Plan runtime budgets and thresholds.
    pub budget: BudgetConfig,
    /// Post-execution hook thresholds.
    pub knowledge: KnowledgeConfig,
    /// Per-user role and allowed-skills grants.
    pub access: AccessConfig,
}

impl KisoConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$KISO_CONFIG_PATH` or `./config.toml`.
    /// If the file does not exist, returns defaults (backward compatible).
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path()?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: KisoConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(KisoConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path.
    fn config_path() -> Result<PathBuf> {
        Self::config_path_with(|key| std::env::var(key).ok())
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(p) = env("KISO_CONFIG_PATH") {
            return Ok(PathBuf::from(p));
        }
        Ok(PathBuf::from("config.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var`
    /// in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("KISO_WORKER_IDLE_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.runtime.worker_idle_timeout_seconds = n,
                Err(_) => tracing::warn!(
                    var = "KISO_WORKER_IDLE_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        if let Some(v) = env("KISO_STORE_DB") {
            self.paths.store_db = v;
        }
        if let Some(v) = env("KISO_AUDIT_LOG") {
            self.paths.audit_log = v;
        }
        if let Some(v) = env("KISO_SESSIONS_DIR") {
            self.paths.sessions_dir = v;
        }
        if let Some(v) = env("KISO_SKILLS_DIR") {
            self.paths.skills_dir = v;
        }
        if let Some(v) = env("KISO_ROLES_DIR") {
            self.paths.roles_dir = v;
        }

        if let Some(key) = env("KISO_ANTHROPIC_API_KEY") {
            let model = env("KISO_ANTHROPIC_MODEL").unwrap_or_else(|| {
                self.llm
                    .anthropic
                    .as_ref()
                    .map(|c| c.model.clone())
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string())
            });
            self.llm.anthropic = Some(LlmCloudConfig { api_key: key, model });
        }

        if let Some(key) = env("KISO_OPENAI_API_KEY") {
            let model = env("KISO_OPENAI_MODEL").unwrap_or_else(|| {
                self.llm
                    .openai
                    .as_ref()
                    .map(|c| c.model.clone())
                    .unwrap_or_else(|| "gpt-4o".to_string())
            });
            let base_url = self
                .llm
                .openai
                .as_ref()
                .map(|c| c.base_url.clone())
                .unwrap_or_else(|| "https://api.openai.com".to_string());
            self.llm.openai = Some(LlmOpenAiConfig { base_url, api_key: key, model });
        }

        if let Some(v) = env("KISO_OLLAMA_URL") {
            self.llm.local.base_url = v;
        }
        if let Some(v) = env("KISO_LOCAL_MODEL") {
            self.llm.local.model = v;
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: KisoConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Runtime config ──────────────────────────────────────────────

/// Scheduler and session worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tracing log level filter.
    pub log_level: String,
    /// Bounded mpsc buffer size per session worker queue.
    pub channel_buffer_size: usize,
    /// Seconds a worker waits on an empty queue before shutting down.
    pub worker_idle_timeout_seconds: u64,
    /// Maximum times the planner is re-prompted after a validation failure.
    pub max_validation_retries: u32,
    /// Maximum replan depth per originating message (before any granted
    /// `extend_replan`).
    pub max_replan_depth: u8,
    /// Exec/skill subprocess timeout in seconds.
    pub exec_timeout_seconds: u64,
    /// Exec/skill output cap in bytes before truncation.
    pub exec_output_cap_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            channel_buffer_size: 100,
            worker_idle_timeout_seconds: 300,
            max_validation_retries: 3,
            max_replan_depth: 5,
            exec_timeout_seconds: 120,
            exec_output_cap_bytes: 1_048_576,
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite store database path.
    pub store_db: String,
    /// Audit log JSONL directory (one file per day).
    pub audit_log: String,
    /// Root directory for per-session workspaces.
    pub sessions_dir: String,
    /// Root directory for installed skill manifests.
    pub skills_dir: String,
    /// Directory of per-role prompt markdown files.
    pub roles_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store_db: "store.db".to_string(),
            audit_log: "audit".to_string(),
            sessions_dir: "sessions".to_string(),
            skills_dir: "skills".to_string(),
            roles_dir: "roles".to_string(),
        }
    }
}

// ── LLM config ──────────────────────────────────────────────────

/// LLM provider configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Local Ollama provider — always available.
    pub local: LlmLocalConfig,
    /// Anthropic provider.
    pub anthropic: Option<LlmCloudConfig>,
    /// OpenAI-compatible provider.
    pub openai: Option<LlmOpenAiConfig>,
    /// Per-message LLM call budget (an ambient counter scoped to
    /// processing one message).
    #[serde(default = "default_max_llm_calls_per_message")]
    pub max_llm_calls_per_message: u32,
}

fn default_max_llm_calls_per_message() -> u32 {
    200
}

/// Local Ollama provider config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmLocalConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for LlmLocalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
        }
    }
}

/// Cloud LLM provider config for Anthropic.
#[derive(Clone, Deserialize)]
pub struct LlmCloudConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
}

impl std::fmt::Debug for LlmCloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmCloudConfig")
            .field("api_key", &"__REDACTED__")
            .field("model", &self.model)
            .finish()
    }
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

/// OpenAI-compatible provider config.
#[derive(Clone, Deserialize)]
pub struct LlmOpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

impl std::fmt::Debug for LlmOpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmOpenAiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"__REDACTED__")
            .field("model", &self.model)
            .finish()
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

// ── Budget config ───────────────────────────────────────────────

/// Plan runtime budgets (beyond `RuntimeConfig`'s structural limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Extra replan depth a planner may grant, capped at this value.
    pub max_extend_replan: u8,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { max_extend_replan: 3 }
    }
}

// ── Knowledge config ────────────────────────────────────────────

/// Post-execution hook thresholds for summarization and fact management.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Raw message count since last summarization that triggers a resummarize.
    pub summarize_threshold: u32,
    /// Total fact count that triggers consolidation.
    pub knowledge_max_facts: u32,
    /// Confidence lost per day a fact goes unused.
    pub fact_decay_rate: f64,
    /// Days of disuse before decay applies.
    pub fact_decay_days: i64,
    /// Confidence floor below which a fact is archived.
    pub fact_archive_threshold: f64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            summarize_threshold: 30,
            knowledge_max_facts: 50,
            fact_decay_rate: 0.05,
            fact_decay_days: 14,
            fact_archive_threshold: 0.1,
        }
    }
}

// ── Access config ───────────────────────────────────────────────

/// A caller's privilege tier. `Admin` bypasses the exec deny-list OS-user
/// restriction (§4.3) and sees every installed skill regardless of
/// `allowed_skills`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

/// One user's grant: role plus the skill-name patterns (see
/// `crate::skills::matches_pattern`) they may invoke.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserGrant {
    pub role: Role,
    pub allowed_skills: Vec<String>,
}

/// Per-user role and allowed-skills grants, keyed by resolved user
/// identity. Re-read on every task dispatch (§4.2 step 7) so a caller
/// downgraded or removed mid-plan is re-evaluated rather than trusted
/// from the moment the message was queued.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub users: std::collections::HashMap<String, UserGrant>,
}

impl AccessConfig {
    /// Resolve a user's current grant, defaulting an unknown user to a
    /// non-admin with no allowed skills (fail closed).
    #[must_use]
    pub fn grant_for(&self, user: &str) -> UserGrant {
        self.users.get(user).cloned().unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_spec_defaults() {
        let config = KisoConfig::default();

        assert_eq!(config.runtime.log_level, "info");
        assert_eq!(config.runtime.channel_buffer_size, 100);
        assert_eq!(config.runtime.max_validation_retries, 3);
        assert_eq!(config.runtime.max_replan_depth, 5);
        assert_eq!(config.runtime.exec_timeout_seconds, 120);
        assert_eq!(config.runtime.exec_output_cap_bytes, 1_048_576);

        assert_eq!(config.paths.store_db, "store.db");
        assert_eq!(config.paths.audit_log, "audit");

        assert_eq!(config.llm.local.base_url, "http://localhost:11434");
        assert_eq!(config.llm.max_llm_calls_per_message, 200);
        assert!(config.llm.anthropic.is_none());
        assert!(config.llm.openai.is_none());

        assert_eq!(config.budget.max_extend_replan, 3);

        assert_eq!(config.knowledge.summarize_threshold, 30);
        assert_eq!(config.knowledge.knowledge_max_facts, 50);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[runtime]
log_level = "debug"
worker_idle_timeout_seconds = 600
max_replan_depth = 7

[paths]
store_db = "/data/kiso/store.db"
audit_log = "/data/kiso/audit"

[llm.local]
base_url = "http://localhost:11435"
model = "qwen3-8b"

[llm]
max_llm_calls_per_message = 50

[llm.anthropic]
api_key = "env:anthropic_api_key"
model = "claude-sonnet-4-20250514"

[budget]
max_extend_replan = 1

[knowledge]
summarize_threshold = 10
"#;
        let config = KisoConfig::from_toml(toml_str).expect("should parse");

        assert_eq!(config.runtime.log_level, "debug");
        assert_eq!(config.runtime.worker_idle_timeout_seconds, 600);
        assert_eq!(config.runtime.max_replan_depth, 7);
        assert_eq!(config.paths.store_db, "/data/kiso/store.db");
        assert_eq!(config.llm.local.base_url, "http://localhost:11435");
        assert_eq!(config.llm.max_llm_calls_per_message, 50);
        assert_eq!(
            config.llm.anthropic.as_ref().expect("anthropic").api_key,
            "env:anthropic_api_key"
        );
        assert_eq!(config.budget.max_extend_replan, 1);
        assert_eq!(config.knowledge.summarize_threshold, 10);
    }

    #[test]
    fn test_parse_partial_toml_uses_defaults() {
        let toml_str = r#"
[runtime]
log_level = "warn"
"#;
        let config = KisoConfig::from_toml(toml_str).expect("should parse");
        assert_eq!(config.runtime.log_level, "warn");
        assert_eq!(config.runtime.max_replan_depth, 5);
        assert_eq!(config.paths.store_db, "store.db");
    }

    #[test]
    fn test_env_overrides_config_values() {
        let mut config = KisoConfig::default();
        let env = |key: &str| -> Option<String> {
            match key {
                "KISO_STORE_DB" => Some("/from/env/store.db".to_string()),
                "KISO_WORKER_IDLE_TIMEOUT_SECS" => Some("15".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);
        assert_eq!(config.paths.store_db, "/from/env/store.db");
        assert_eq!(config.runtime.worker_idle_timeout_seconds, 15);
    }

    #[test]
    fn test_env_creates_anthropic_provider() {
        let mut config = KisoConfig::default();
        assert!(config.llm.anthropic.is_none());
        let env = |key: &str| -> Option<String> {
            match key {
                "KISO_ANTHROPIC_API_KEY" => Some("sk-test-123".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);
        let anthropic = config.llm.anthropic.as_ref().expect("should be created");
        assert_eq!(anthropic.api_key, "sk-test-123");
        assert_eq!(anthropic.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let result = KisoConfig::from_toml("this is {{ not valid toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_path_uses_env_var() {
        let path = KisoConfig::config_path_with(|key| match key {
            "KISO_CONFIG_PATH" => Some("/custom/config.toml".to_string()),
            _ => None,
        })
        .expect("should resolve");
        assert_eq!(path, PathBuf::from("/custom/config.toml"));
    }

    #[test]
    fn test_config_path_defaults_to_cwd() {
        let path = KisoConfig::config_path_with(|_| None).expect("should resolve");
        assert_eq!(path, PathBuf::from("config.toml"));
    }

    #[test]
    fn test_access_grant_defaults_to_user_with_no_skills() {
        let config = AccessConfig::default();
        let grant = config.grant_for("unknown");
        assert_eq!(grant.role, Role::User);
        assert!(grant.allowed_skills.is_empty());
    }

    #[test]
    fn test_access_grant_parses_from_toml() {
        let toml_str = r#"
[access.users.alice]
role = "admin"
allowed_skills = ["*"]

[access.users.bob]
role = "user"
allowed_skills = ["weather", "email.*"]
"#;
        let config = KisoConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.access.grant_for("alice").role, Role::Admin);
        assert_eq!(config.access.grant_for("bob").allowed_skills, vec!["weather", "email.*"]);
    }

    #[test]
    fn test_llm_cloud_config_debug_redacts_key() {
        let cfg = LlmCloudConfig {
            api_key: "sk-ant-super-secret".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sk-ant-super-secret"));
        assert!(rendered.contains("__REDACTED__"));
    }
}
