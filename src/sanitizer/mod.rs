//! Sanitizer & Fencer: the untrusted-input defense pipeline.
//!
//! The sanitizer strips known secret values (plaintext, base64, and
//! URL-encoded variants) from any text about to leave the process boundary
//! — stored, logged, sent to an LLM, or delivered to a webhook. The fencer
//! wraps untrusted content in per-call random delimiters so a prompt
//! cannot forge the boundary of its own fence.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::RngCore;
use regex::Regex;

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Redacts known secret values — and their base64/URL-encoded variants —
/// plus a defense-in-depth set of known provider token shapes.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<Regex>,
}

impl Sanitizer {
    /// Construct a sanitizer. The hardcoded provider patterns below catch
    /// secrets that never passed through the Secret Registry (e.g. a
    /// credential pasted directly into a message).
    #[must_use]
    pub fn new() -> Self {
        Self { patterns: default_patterns() }
    }

    /// Redact every variant of every secret value in `secrets`, then apply
    /// the defense-in-depth provider patterns.
    #[must_use]
    pub fn sanitize<'a>(&self, text: &str, secrets: impl IntoIterator<Item = &'a str>) -> String {
        let mut sanitized = text.to_owned();
        for secret in secrets {
            if secret.is_empty() {
                continue;
            }
            sanitized = sanitized.replace(secret, REDACTION_MARKER);

            let b64 = BASE64.encode(secret.as_bytes());
            sanitized = sanitized.replace(&b64, REDACTION_MARKER);

            let url_encoded = utf8_percent_encode(secret, NON_ALPHANUMERIC).to_string();
            if url_encoded != secret {
                sanitized = sanitized.replace(&url_encoded, REDACTION_MARKER);
            }
        }
        for pattern in &self.patterns {
            sanitized = pattern.replace_all(&sanitized, REDACTION_MARKER).to_string();
        }
        sanitized
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"glpat-[A-Za-z0-9_\-]{16,}",
        r"xoxb-[A-Za-z0-9\-]{20,}",
    ];
    patterns.iter().filter_map(|pattern| Regex::new(pattern).ok()).collect()
}

/// Label identifying why a block of text was fenced, used in the fence
/// marker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceLabel {
    /// A paraphrased inbound message.
    UntrustedCtx,
    /// An exec/skill/search task output passed to the reviewer or a
    /// replan planner call.
    TaskOutput,
    /// Any other externally-originated material.
    ExternalContext,
}

impl FenceLabel {
    fn as_str(self) -> &'static str {
        match self {
            Self::UntrustedCtx => "UNTRUSTED_CTX",
            Self::TaskOutput => "TASK_OUTPUT",
            Self::ExternalContext => "EXTERNAL_CONTEXT",
        }
    }
}

/// Wraps untrusted content in a per-call random-boundary fence so the
/// content cannot forge its own closing marker.
///
/// A fresh 16-byte random hex suffix is generated per call (per LLM call,
/// by construction of the callers), which is why `Fencer` carries no
/// state — each `fence` call is independent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fencer;

impl Fencer {
    /// Construct a fencer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Escape any existing `<<<...>>>` sequences in `content`, then wrap it
    /// with a freshly generated random-boundary fence.
    #[must_use]
    pub fn fence(&self, label: FenceLabel, content: &str) -> String {
        let rand_hex = random_hex(16);
        self.fence_with_hex(label, content, &rand_hex)
    }

    fn fence_with_hex(&self, label: FenceLabel, content: &str, rand_hex: &str) -> String {
        let escaped = escape_fence_markers(content);
        let label = label.as_str();
        format!(
            "<<<{label}_{rand_hex}>>>\n{escaped}\n<<<END_{label}_{rand_hex}>>>"
        )
    }
}

/// Replace any `<<<...>>>`-shaped sequence with a non-conflicting
/// lookalike so fenced content can never forge a closing marker.
fn escape_fence_markers(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let bytes = content.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if content[i..].starts_with("<<<") {
            if let Some(end) = content[i..].find(">>>") {
                let inner = &content[i + 3..i + end];
                out.push_str("«««");
                out.push_str(inner);
                out.push_str("»»»");
                i += end + 3;
                continue;
            }
        }
        let ch = content[i..].chars().next().unwrap_or('\u{0}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0_u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
