//! Audit (C11): append-only JSONL sink for LLM calls, task executions,
//! review verdicts, and webhook deliveries.
//!
//! One file per day under the configured audit directory
//! (`audit/YYYY-MM-DD.jsonl`), each line a JSON object with common fields
//! `{timestamp, type, session}` plus type-specific fields. Every field
//! that might carry a secret is sanitized before it reaches this sink —
//! callers pass already-redacted text, this module does not re-sanitize.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;

/// One audit entry, tagged by kind. Serialized with `serde_json` into a
/// single JSONL line.
#[derive(Debug, Clone)]
pub enum AuditEntry {
    Llm {
        session: String,
        role: String,
        model: String,
        provider: String,
        input_tokens: i64,
        output_tokens: i64,
        duration_ms: u64,
        status: &'static str,
    },
    Task {
        session: String,
        task_id: i64,
        task_type: String,
        detail: String,
        status: String,
        duration_ms: u64,
        output_length: usize,
    },
    Webhook {
        session: String,
        task_id: i64,
        url: String,
        status: &'static str,
        attempts: u32,
    },
    Review {
        session: String,
        task_id: i64,
        verdict: String,
        has_learning: bool,
    },
}

impl AuditEntry {
    fn session(&self) -> &str {
        match self {
            Self::Llm { session, .. }
            | Self::Task { session, .. }
            | Self::Webhook { session, .. }
            | Self::Review { session, .. } => session,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Llm { .. } => "llm",
            Self::Task { .. } => "task",
            Self::Webhook { .. } => "webhook",
            Self::Review { .. } => "review",
        }
    }

    fn to_json(&self) -> serde_json::Value {
        let mut value = match self {
            Self::Llm { role, model, provider, input_tokens, output_tokens, duration_ms, status, .. } => {
                json!({
                    "role": role, "model": model, "provider": provider,
                    "input_tokens": input_tokens, "output_tokens": output_tokens,
                    "duration_ms": duration_ms, "status": status,
                })
            }
            Self::Task { task_id, task_type, detail, status, duration_ms, output_length, .. } => json!({
                "task_id": task_id, "task_type": task_type, "detail": detail,
                "status": status, "duration_ms": duration_ms, "output_length": output_length,
            }),
            Self::Webhook { task_id, url, status, attempts, .. } => json!({
                "task_id": task_id, "url": url, "status": status, "attempts": attempts,
            }),
            Self::Review { task_id, verdict, has_learning, .. } => json!({
                "task_id": task_id, "verdict": verdict, "has_learning": has_learning,
            }),
        };
        let object = value.as_object_mut().expect("entry variants always serialize to objects");
        object.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        object.insert("type".to_string(), json!(self.kind()));
        object.insert("session".to_string(), json!(self.session()));
        value
    }
}

/// Append-only JSONL sink, one file per UTC calendar day.
///
/// A single `Mutex<()>` serializes writes across concurrent session
/// workers; each write is a single `write_all` + `flush` so a torn write
/// can only ever drop the last line, never corrupt a prior one.
pub struct AuditLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    /// Construct a sink rooted at `dir` (typically `config.paths.audit_log`).
    /// The directory is created lazily on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: Mutex::new(()) }
    }

    /// Append one entry. Failures are logged, never propagated: a broken
    /// audit sink must not abort an in-flight plan.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.try_record(&entry) {
            tracing::error!(error = %e, kind = entry.kind(), "failed to write audit entry");
        }
    }

    fn try_record(&self, entry: &AuditEntry) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for_today();
        let line = serde_json::to_string(&entry.to_json())?;
        let _guard = self.lock.lock().unwrap_or_else(|poison| poison.into_inner());
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        file.flush()
    }

    fn path_for_today(&self) -> PathBuf {
        self.path_for_date(&Utc::now().format("%Y-%m-%d").to_string())
    }

    fn path_for_date(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}.jsonl"))
    }

    /// Read back today's entries, for tests.
    #[cfg(test)]
    fn read_today(&self) -> Vec<serde_json::Value> {
        read_jsonl(&self.path_for_today())
    }
}

#[cfg(test)]
fn read_jsonl(path: &std::path::Path) -> Vec<serde_json::Value> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_llm_entry_has_common_and_specific_fields() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.record(AuditEntry::Llm {
            session: "s1".to_string(),
            role: "planner".to_string(),
            model: "llama3".to_string(),
            provider: "local".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            duration_ms: 250,
            status: "ok",
        });
        let entries = audit.read_today();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["type"], "llm");
        assert_eq!(entries[0]["session"], "s1");
        assert_eq!(entries[0]["role"], "planner");
        assert!(entries[0]["timestamp"].is_string());
    }

    #[test]
    fn test_record_task_entry() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.record(AuditEntry::Task {
            session: "s1".to_string(),
            task_id: 7,
            task_type: "exec".to_string(),
            detail: "list files".to_string(),
            status: "done".to_string(),
            duration_ms: 40,
            output_length: 120,
        });
        let entries = audit.read_today();
        assert_eq!(entries[0]["type"], "task");
        assert_eq!(entries[0]["task_id"], 7);
    }

    #[test]
    fn test_multiple_records_append_as_separate_lines() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        for i in 0..5 {
            audit.record(AuditEntry::Review {
                session: "s1".to_string(),
                task_id: i,
                verdict: "ok".to_string(),
                has_learning: false,
            });
        }
        assert_eq!(audit.read_today().len(), 5);
    }

    #[test]
    fn test_webhook_entry_records_attempts() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.record(AuditEntry::Webhook {
            session: "s1".to_string(),
            task_id: 3,
            url: "https://example.com/hook".to_string(),
            status: "failed",
            attempts: 3,
        });
        let entries = audit.read_today();
        assert_eq!(entries[0]["attempts"], 3);
        assert_eq!(entries[0]["status"], "failed");
    }

    #[test]
    fn test_file_is_named_by_todays_date() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.record(AuditEntry::Review {
            session: "s1".to_string(),
            task_id: 1,
            verdict: "ok".to_string(),
            has_learning: false,
        });
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(dir.path().join(format!("{today}.jsonl")).exists());
    }
}
