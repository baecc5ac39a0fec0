//! Webhook delivery (§4.4): POSTs a `msg` task's output to a session's
//! configured webhook URL, retrying on failure with a fixed backoff.
//!
//! Delivery failure is logged and audited but never fails the plan — a
//! session with no reachable webhook should still finish its plan and
//! leave the message recorded for `/status` polling.

use std::time::Duration;

use crate::contract::WebhookPayload;
use crate::kernel::audit::{AuditEntry, AuditLog};

/// Seconds to wait before each retry, in order.
const RETRY_BACKOFF_SECONDS: [u64; 3] = [1, 3, 9];

/// Deliver one webhook payload, retrying up to `RETRY_BACKOFF_SECONDS.len()`
/// additional times on failure. Every attempt is audited; the final
/// outcome (`delivered` or `failed`) is always logged even when every
/// attempt fails.
pub async fn deliver(
    client: &reqwest::Client,
    webhook_url: &str,
    payload: &WebhookPayload,
    audit: &AuditLog,
) {
    let attempts_allowed = RETRY_BACKOFF_SECONDS.len() + 1;
    for attempt in 1..=attempts_allowed {
        match client.post(webhook_url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                audit.record(AuditEntry::Webhook {
                    session: payload.session.clone(),
                    task_id: payload.task_id,
                    url: webhook_url.to_string(),
                    status: "delivered",
                    attempts: u32::try_from(attempt).unwrap_or(u32::MAX),
                });
                return;
            }
            Ok(resp) => {
                tracing::warn!(
                    session = %payload.session,
                    task_id = payload.task_id,
                    status = %resp.status(),
                    attempt,
                    "webhook delivery returned non-2xx"
                );
            }
            Err(e) => {
                tracing::warn!(
                    session = %payload.session,
                    task_id = payload.task_id,
                    error = %e,
                    attempt,
                    "webhook delivery request failed"
                );
            }
        }
        if let Some(&seconds) = RETRY_BACKOFF_SECONDS.get(attempt - 1) {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
    }

    audit.record(AuditEntry::Webhook {
        session: payload.session.clone(),
        task_id: payload.task_id,
        url: webhook_url.to_string(),
        status: "failed",
        attempts: u32::try_from(attempts_allowed).unwrap_or(u32::MAX),
    });
    tracing::error!(
        session = %payload.session,
        task_id = payload.task_id,
        "webhook delivery exhausted all retries"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn test_deliver_records_failure_after_exhausting_retries() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        let client = reqwest::Client::new();
        let payload = WebhookPayload::new("s1", 1, "hello", true);

        // Port 1 is reserved and refuses the connection immediately; the
        // paused clock fast-forwards the 1/3/9s backoff between attempts.
        deliver(&client, "http://127.0.0.1:1/hook", &payload, &audit).await;

        let entries = read_jsonl(&audit_today_path(dir.path()));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["status"], "failed");
        assert_eq!(entries[0]["attempts"], 4);
    }

    fn audit_today_path(dir: &std::path::Path) -> std::path::PathBuf {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        dir.join(format!("{today}.jsonl"))
    }

    fn read_jsonl(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}
