//! Shared text-cleanup helpers for structured-output role parsing.
//!
//! The Gateway already rejects a completion that doesn't parse as JSON
//! when a schema was requested, but local models commonly wrap that JSON
//! in a reasoning block or a markdown fence anyway. Stripping those first
//! means a retry is only spent on a genuinely malformed response.

/// Remove a leading `<think>...</think>` block some local models emit
/// before their actual answer.
pub(super) fn strip_think_tags(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return rest[end + "</think>".len()..].trim_start();
        }
    }
    trimmed
}

/// If `text` is wrapped in a markdown code fence (` ```json ... ``` ` or
/// plain ` ``` ... ``` `), return just the fenced body.
pub(super) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

/// Apply both cleanups, in the order a model is likely to nest them.
pub(super) fn clean_structured_output(text: &str) -> &str {
    strip_code_fence(strip_think_tags(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_think_tags_removes_leading_block() {
        let input = "<think>reasoning here</think>\n{\"a\":1}";
        assert_eq!(strip_think_tags(input), "{\"a\":1}");
    }

    #[test]
    fn test_strip_think_tags_noop_without_block() {
        assert_eq!(strip_think_tags("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_strip_code_fence_removes_json_fence() {
        let input = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(input), "{\"a\":1}");
    }

    #[test]
    fn test_strip_code_fence_removes_plain_fence() {
        let input = "```\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(input), "{\"a\":1}");
    }

    #[test]
    fn test_strip_code_fence_noop_without_fence() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_clean_structured_output_handles_both_wrappers() {
        let input = "<think>hmm</think>\n```json\n{\"a\":1}\n```";
        assert_eq!(clean_structured_output(input), "{\"a\":1}");
    }
}
