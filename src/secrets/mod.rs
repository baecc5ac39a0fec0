//! Secret Registry: process-wide deploy secrets plus per-worker ephemeral
//! secrets.
//!
//! Deploy secrets are environment-variable-style strings owned by the
//! process, reloadable atomically via `POST /admin/reload-env`. Ephemeral
//! secrets are `{key, value}` pairs emitted by the planner, held only in
//! the originating session worker's in-memory map; they are never
//! persisted and die with the worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::RwLock;

use crate::types::EphemeralSecret;

/// Opaque secret value whose `Debug` output never exposes the underlying
/// string, to prevent accidental leakage into logs.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a raw secret string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the raw value. Callers must route the result through the
    /// sanitizer before it reaches any log, LLM prompt, or webhook.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Process-wide deploy secrets, hot-reloadable without a restart.
///
/// Each file directly under `dir` becomes one secret keyed by filename,
/// valued by the file's trimmed contents — mirroring how container
/// orchestrators mount secrets as files. The live set is held behind an
/// `RwLock` and replaced wholesale on reload so that readers never observe
/// a partially-updated set.
pub struct DeploySecrets {
    dir: PathBuf,
    current: Arc<RwLock<HashMap<String, SecretValue>>>,
}

impl DeploySecrets {
    /// An empty set bound to no directory, for tests that exercise
    /// components depending on `DeploySecrets` without caring about the
    /// deploy-secret feature itself. `reload` against this instance always
    /// yields an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self { dir: PathBuf::new(), current: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Load the initial secret set from `dir`. A missing directory yields
    /// an empty set rather than an error, since deploy secrets are
    /// optional.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` exists but cannot be read.
    pub async fn load(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let current = Arc::new(RwLock::new(read_secret_dir(&dir)?));
        Ok(Self { dir, current })
    }

    /// Re-read the secrets directory and atomically swap the live set.
    /// Returns the keys present after reload, for audit logging.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    pub async fn reload(&self) -> anyhow::Result<Vec<String>> {
        let fresh = read_secret_dir(&self.dir)?;
        let mut keys: Vec<String> = fresh.keys().cloned().collect();
        keys.sort();
        let mut guard = self.current.write().await;
        *guard = fresh;
        Ok(keys)
    }

    /// Snapshot the current deploy secret values, for sanitization.
    pub async fn snapshot(&self) -> Vec<SecretValue> {
        self.current.read().await.values().cloned().collect()
    }

    /// Look up a single deploy secret by key, e.g. for skill env injection.
    pub async fn get(&self, key: &str) -> Option<SecretValue> {
        self.current.read().await.get(key).cloned()
    }

    /// List known deploy secret keys (values are never returned).
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.current.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for DeploySecrets {
    fn default() -> Self {
        Self::new()
    }
}

fn read_secret_dir(dir: &Path) -> anyhow::Result<HashMap<String, SecretValue>> {
    let mut out = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if !entry.file_type().with_context(|| "failed to stat secret entry")?.is_file() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().into_owned();
        let contents = std::fs::read_to_string(entry.path())
            .with_context(|| format!("failed to read secret file {}", entry.path().display()))?;
        out.insert(key, SecretValue::new(contents.trim_end_matches('\n').to_string()));
    }
    Ok(out)
}

/// A session worker's in-memory map of ephemeral secrets, emitted by the
/// planner and scoped to that worker's lifetime.
///
/// Deliberately holds no reference to the store: by invariant, ephemeral
/// secrets must never reach a persisted row.
#[derive(Debug, Clone, Default)]
pub struct EphemeralSecrets {
    values: HashMap<String, String>,
}

impl EphemeralSecrets {
    /// An empty map, for a freshly spawned worker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge planner-emitted secrets into the map, overwriting existing
    /// keys.
    pub fn extend(&mut self, secrets: impl IntoIterator<Item = EphemeralSecret>) {
        for s in secrets {
            self.values.insert(s.key, s.value);
        }
    }

    /// Values currently held, for sanitization against outbound text.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.values().map(String::as_str)
    }

    /// Look up declared keys for a skill invocation's `session_secrets`
    /// stdin field.
    #[must_use]
    pub fn subset(&self, keys: &[String]) -> HashMap<String, String> {
        keys.iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// True if the map holds no secrets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_deploy_secrets_missing_dir_is_empty() {
        let secrets = DeploySecrets::load("/nonexistent/path/for/test").await.unwrap();
        assert!(secrets.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_deploy_secrets_loads_files_as_entries() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("openai_api_key"), "sk-test-123\n").unwrap();
        std::fs::write(dir.path().join("webhook_secret"), "whs_456").unwrap();

        let secrets = DeploySecrets::load(dir.path()).await.unwrap();
        let mut keys = secrets.keys().await;
        keys.sort();
        assert_eq!(keys, vec!["openai_api_key", "webhook_secret"]);

        let val = secrets.get("openai_api_key").await.unwrap();
        assert_eq!(val.expose(), "sk-test-123");
    }

    #[tokio::test]
    async fn test_deploy_secrets_reload_swaps_atomically() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "1").unwrap();
        let secrets = DeploySecrets::load(dir.path()).await.unwrap();
        assert_eq!(secrets.keys().await, vec!["a"]);

        std::fs::remove_file(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("b"), "2").unwrap();
        let reloaded_keys = secrets.reload().await.unwrap();
        assert_eq!(reloaded_keys, vec!["b"]);
        assert!(secrets.get("a").await.is_none());
        assert_eq!(secrets.get("b").await.unwrap().expose(), "2");
    }

    #[test]
    fn test_secret_value_debug_is_redacted() {
        let v = SecretValue::new("super-secret-token");
        assert_eq!(format!("{v:?}"), "__REDACTED__");
    }

    #[test]
    fn test_ephemeral_secrets_extend_and_subset() {
        let mut ephemeral = EphemeralSecrets::new();
        assert!(ephemeral.is_empty());
        ephemeral.extend(vec![
            EphemeralSecret { key: "api_token".to_string(), value: "tok_abc123".to_string() },
            EphemeralSecret { key: "db_pass".to_string(), value: "hunter2".to_string() },
        ]);
        assert!(!ephemeral.is_empty());

        let subset = ephemeral.subset(&["api_token".to_string(), "missing".to_string()]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.get("api_token").unwrap(), "tok_abc123");
    }

    #[test]
    fn test_ephemeral_secrets_overwrite_on_replan() {
        let mut ephemeral = EphemeralSecrets::new();
        ephemeral.extend(vec![EphemeralSecret { key: "k".to_string(), value: "v1".to_string() }]);
        ephemeral.extend(vec![EphemeralSecret { key: "k".to_string(), value: "v2".to_string() }]);
        let subset = ephemeral.subset(&["k".to_string()]);
        assert_eq!(subset.get("k").unwrap(), "v2");
    }
}
