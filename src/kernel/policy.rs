//! Policy: per-task access re-checks and exec privilege separation (§4.2
//! step 7, §4.3).
//!
//! A privilege check re-run at the point of use rather than cached from
//! ingest time: a caller's role and allowed-skill
//! grant are re-read from configuration immediately before each task
//! dispatch, so a mid-plan revocation takes effect without restarting the
//! worker.

use crate::config::{AccessConfig, Role};

/// Why a task was refused by the policy re-check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("caller '{user}' was downgraded to a role that no longer permits this task")]
    RoleDowngraded { user: String },
    #[error("caller '{user}' no longer has access to skill '{skill}'")]
    SkillRevoked { user: String, skill: String },
    #[error("command matches a destructive pattern and was refused: {matched_pattern}")]
    DestructiveCommand { matched_pattern: String },
}

/// Re-read `user`'s current grant and confirm it still permits dispatching
/// a `skill` task against `skill_name`. Called immediately before
/// execution, not cached from message ingest, per §4.2 step 7.
pub fn recheck_skill_access(
    access: &AccessConfig,
    user: &str,
    skill_name: &str,
) -> Result<(), PolicyError> {
    let grant = access.grant_for(user);
    if grant.role == Role::Admin {
        return Ok(());
    }
    if !crate::skills::is_allowed(skill_name, &grant.allowed_skills) {
        return Err(PolicyError::SkillRevoked {
            user: user.to_string(),
            skill: skill_name.to_string(),
        });
    }
    Ok(())
}

/// The OS identity an `exec` task's command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecIdentity {
    /// Runs directly as the Kiso process user — only for admin callers.
    Admin,
    /// Runs wrapped in `sudo -u <os_user>` — the default for non-admin
    /// callers, scoping blast radius to that user's own permissions.
    Restricted { os_user: String },
}

/// Resolve the exec identity a task should run under, given the caller's
/// current grant and the fallback restricted OS user configured for
/// non-admin execution.
#[must_use]
pub fn resolve_exec_identity(access: &AccessConfig, user: &str, restricted_os_user: &str) -> ExecIdentity {
    let grant = access.grant_for(user);
    match grant.role {
        Role::Admin => ExecIdentity::Admin,
        Role::User => ExecIdentity::Restricted { os_user: restricted_os_user.to_string() },
    }
}

/// Literal substrings that mark a translated shell command as destructive
/// regardless of caller privilege. Not a security boundary on its own —
/// paired with [`ExecIdentity`] restriction and the sanitizer — but catches
/// the common idioms a translator should never have produced in the first
/// place.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "mkfs.",
    "dd if=/dev/zero",
    "dd if=/dev/random of=/dev/sd",
    ":(){ :|:& };:",
    "> /dev/sda",
    "chmod -R 777 /",
    "curl | sh",
    "curl | bash",
    "wget -O- | sh",
    "| base64 -d | sh",
    "| base64 --decode | sh",
];

/// Screen a translated command for a known-destructive idiom before it is
/// ever spawned.
pub fn screen_destructive(command: &str) -> Result<(), PolicyError> {
    let lowered = command.to_lowercase();
    for pattern in DESTRUCTIVE_PATTERNS {
        if lowered.contains(pattern) {
            return Err(PolicyError::DestructiveCommand { matched_pattern: (*pattern).to_string() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserGrant;
    use std::collections::HashMap;

    fn access_with(user: &str, role: Role, allowed_skills: &[&str]) -> AccessConfig {
        let mut users = HashMap::new();
        users.insert(
            user.to_string(),
            UserGrant { role, allowed_skills: allowed_skills.iter().map(|s| s.to_string()).collect() },
        );
        AccessConfig { users }
    }

    #[test]
    fn test_admin_bypasses_skill_allow_list() {
        let access = access_with("alice", Role::Admin, &[]);
        assert!(recheck_skill_access(&access, "alice", "anything").is_ok());
    }

    #[test]
    fn test_user_denied_when_skill_not_in_grant() {
        let access = access_with("bob", Role::User, &["weather"]);
        let err = recheck_skill_access(&access, "bob", "docker.exec").unwrap_err();
        assert!(matches!(err, PolicyError::SkillRevoked { .. }));
    }

    #[test]
    fn test_user_allowed_when_skill_matches_pattern() {
        let access = access_with("bob", Role::User, &["email.*"]);
        assert!(recheck_skill_access(&access, "bob", "email.send").is_ok());
    }

    #[test]
    fn test_unknown_user_denied_by_default() {
        let access = AccessConfig::default();
        let err = recheck_skill_access(&access, "stranger", "weather").unwrap_err();
        assert!(matches!(err, PolicyError::SkillRevoked { .. }));
    }

    #[test]
    fn test_exec_identity_admin_runs_unrestricted() {
        let access = access_with("alice", Role::Admin, &[]);
        let identity = resolve_exec_identity(&access, "alice", "kiso-sandbox");
        assert_eq!(identity, ExecIdentity::Admin);
    }

    #[test]
    fn test_exec_identity_user_runs_restricted() {
        let access = access_with("bob", Role::User, &[]);
        let identity = resolve_exec_identity(&access, "bob", "kiso-sandbox");
        assert_eq!(identity, ExecIdentity::Restricted { os_user: "kiso-sandbox".to_string() });
    }

    #[test]
    fn test_screen_destructive_catches_rm_rf_root() {
        let err = screen_destructive("rm -rf /").unwrap_err();
        assert!(matches!(err, PolicyError::DestructiveCommand { .. }));
    }

    #[test]
    fn test_screen_destructive_catches_curl_pipe_sh_case_insensitive() {
        assert!(screen_destructive("CURL | SH").is_err());
    }

    #[test]
    fn test_screen_destructive_allows_benign_command() {
        assert!(screen_destructive("ls -la /tmp").is_ok());
    }
}
