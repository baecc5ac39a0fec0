//! Task Executor (C7, §4.2 step 6): dispatches one task by type, producing
//! the output the reviewer judges.
//!
//! Stdio-piped `tokio::process::Command` with `kill_on_drop`, JSON handed
//! to the child, applied to Kiso's two subprocess-backed task types.
//! `exec` translates
//! its detail into a shell command first; `skill` spawns the skill's own
//! virtualenv interpreter against a fixed stdin contract. `msg` and
//! `search` have no subprocess at all: they dispatch straight to their
//! role pipeline and return its text.
//!
//! A subprocess task type never returns a hard error for anything the
//! subprocess itself does wrong (refused translation, non-zero exit,
//! timeout, missing binary) — those become a `succeeded: false`
//! [`ExecutionResult`] the reviewer gets to see and react to. Only a
//! genuine LLM Gateway failure (budget exhausted, provider unreachable)
//! propagates, since at that point there is no output to review at all.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{AccessConfig, LlmConfig};
use crate::kernel::policy::{self, ExecIdentity, PolicyError};
use crate::kernel::roles::{
    invoke_exec_translator, invoke_messenger, invoke_searcher, ExecTranslation, RoleContext,
};
use crate::llm::{LlmError, LlmGateway, MessageBudget};
use crate::sanitizer::{Fencer, Sanitizer};
use crate::skills::registry::InstalledSkill;
use crate::types::PlanOutputEntry;

/// A subprocess-backed task's result: already truncated and sanitized,
/// ready to hand to `Store::finish_task`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The command actually run, for `exec` tasks (persisted to `Task::command`).
    pub command: Option<String>,
    /// Sanitized, truncated stdout (or an explanatory message when the
    /// subprocess never ran at all).
    pub output: String,
    /// Sanitized, truncated stderr, omitted when empty.
    pub stderr: Option<String>,
    /// Whether the subprocess exited zero. `false` covers translation
    /// refusal, a destructive-command refusal, a non-zero exit, a
    /// timeout, or a failure to spawn.
    pub succeeded: bool,
}

const TRUNCATION_NOTICE: &str = "\n...[output truncated]";

/// Truncate `text` to at most `cap` bytes on a UTF-8 char boundary,
/// appending [`TRUNCATION_NOTICE`] when truncation occurred.
fn truncate(mut text: String, cap: usize) -> String {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(TRUNCATION_NOTICE);
    text
}

/// Translate and run one `exec` task's command.
///
/// # Errors
///
/// Returns an error only if the exec-translator LLM call itself fails;
/// every other failure mode (refused translation, destructive-pattern
/// match, non-zero exit, timeout, spawn failure) is reported as a
/// `succeeded: false` result instead.
#[allow(clippy::too_many_arguments)]
pub async fn execute_exec(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    translator_prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
    sanitizer: &Sanitizer,
    secret_values: &[String],
    access: &AccessConfig,
    user: &str,
    restricted_os_user: &str,
    workspace: &Path,
    timeout: Duration,
    output_cap_bytes: usize,
) -> Result<ExecutionResult, LlmError> {
    write_plan_outputs_file(workspace, &ctx.preceding_plan_outputs);

    let (translation, _completion) =
        invoke_exec_translator(gateway, budget, llm_config, translator_prompt, ctx, fencer).await?;

    let command = match translation {
        ExecTranslation::Command(cmd) => cmd,
        ExecTranslation::CannotTranslate => {
            return Ok(ExecutionResult {
                command: None,
                output: "the exec translator could not produce a safe command for this task"
                    .to_string(),
                stderr: None,
                succeeded: false,
            });
        }
    };

    if let Err(PolicyError::DestructiveCommand { matched_pattern }) =
        policy::screen_destructive(&command)
    {
        return Ok(ExecutionResult {
            command: Some(command),
            output: format!("command refused: matches destructive pattern '{matched_pattern}'"),
            stderr: None,
            succeeded: false,
        });
    }

    let identity = policy::resolve_exec_identity(access, user, restricted_os_user);
    let mut cmd = command_for_identity(&identity, &command);
    cmd.current_dir(workspace)
        .env_clear()
        .env("PATH", "/usr/bin:/bin:/usr/local/bin")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let raw = run_with_timeout(cmd, timeout).await;
    Ok(finalize(Some(command), raw, sanitizer, secret_values, output_cap_bytes))
}

/// Relative path of the task-output-chaining file an `exec` task's
/// translated command can read (§4.2 "Task output chaining").
const PLAN_OUTPUTS_RELATIVE_PATH: &str = ".kiso/plan_outputs.json";

/// Write the in-flight plan-outputs array to `<workspace>/.kiso/plan_outputs.json`
/// before an `exec` task's command runs. Best-effort: a write failure (e.g.
/// a read-only workspace) does not fail the task, since the array is also
/// available to the command via its own shell environment if it cares to
/// look, and exec tasks do not require the file to be present.
fn write_plan_outputs_file(workspace: &Path, outputs: &[PlanOutputEntry]) {
    let dir = workspace.join(".kiso");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    if let Ok(body) = serde_json::to_string(outputs) {
        let _ = std::fs::write(dir.join("plan_outputs.json"), body);
    }
}

/// Remove the task-output-chaining file on plan termination (§4.2: "File
/// is removed on plan termination").
pub fn remove_plan_outputs_file(workspace: &Path) {
    let _ = std::fs::remove_file(workspace.join(PLAN_OUTPUTS_RELATIVE_PATH));
}

/// Build the `sudo -u <user>`-wrapped or direct shell invocation of `command`.
fn command_for_identity(identity: &ExecIdentity, command: &str) -> Command {
    match identity {
        ExecIdentity::Admin => {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(command);
            cmd
        }
        ExecIdentity::Restricted { os_user } => {
            let mut cmd = Command::new("sudo");
            cmd.arg("-u").arg(os_user).arg("/bin/sh").arg("-c").arg(command);
            cmd
        }
    }
}

/// Stdin contract handed to a skill's `run.py`.
#[derive(Serialize)]
struct SkillStdin<'a> {
    args: Value,
    session: &'a str,
    workspace: String,
    session_secrets: HashMap<String, String>,
    plan_outputs: &'a [PlanOutputEntry],
}

/// Spawn `skill`'s virtualenv interpreter against its `run.py`, feeding the
/// stdin contract and capturing stdout/stderr. Never returns a hard error:
/// a malformed `args_json`, a missing interpreter, or a non-zero exit all
/// become a `succeeded: false` result.
#[allow(clippy::too_many_arguments)]
pub async fn execute_skill(
    skill: &InstalledSkill,
    args_json: Option<&str>,
    session: &str,
    workspace: &Path,
    session_secrets: HashMap<String, String>,
    plan_outputs: &[PlanOutputEntry],
    env_values: HashMap<String, String>,
    sanitizer: &Sanitizer,
    secret_values: &[String],
    timeout: Duration,
    output_cap_bytes: usize,
) -> ExecutionResult {
    let args = match args_json {
        Some(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        None => Value::Object(serde_json::Map::new()),
    };
    let stdin_payload = SkillStdin {
        args,
        session,
        workspace: workspace.to_string_lossy().into_owned(),
        session_secrets,
        plan_outputs,
    };
    let stdin_json = match serde_json::to_string(&stdin_payload) {
        Ok(s) => s,
        Err(e) => {
            return ExecutionResult {
                command: None,
                output: format!("failed to encode skill stdin contract: {e}"),
                stderr: None,
                succeeded: false,
            }
        }
    };

    let mut cmd = Command::new(skill.interpreter());
    cmd.arg(skill.entrypoint())
        .current_dir(workspace)
        .env_clear()
        .envs(&env_values)
        .env("PATH", "/usr/bin:/bin:/usr/local/bin")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let raw = run_skill_subprocess(cmd, &stdin_json, timeout).await;
    finalize(None, raw, sanitizer, secret_values, output_cap_bytes)
}

/// Compose the message to deliver for a `msg` task.
///
/// # Errors
///
/// Returns an error if the messenger LLM call fails.
pub async fn execute_msg(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
    fencer: &Fencer,
) -> Result<String, LlmError> {
    let completion = invoke_messenger(gateway, budget, llm_config, system_prompt, ctx, fencer).await?;
    Ok(completion.text)
}

/// Perform a `search` task.
///
/// # Errors
///
/// Returns an error if the searcher LLM call fails.
pub async fn execute_search(
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    system_prompt: &str,
    ctx: &RoleContext,
) -> Result<String, LlmError> {
    let completion = invoke_searcher(gateway, budget, llm_config, system_prompt, ctx).await?;
    Ok(completion.text)
}

/// Outcome of actually running a spawned child process, before
/// sanitization/truncation.
enum RawOutcome {
    Completed { status_ok: bool, stdout: Vec<u8>, stderr: Vec<u8> },
    SpawnFailed(std::io::Error),
    TimedOut,
}

async fn run_with_timeout(mut cmd: Command, timeout: Duration) -> RawOutcome {
    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return RawOutcome::SpawnFailed(e),
    };
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => RawOutcome::Completed {
            status_ok: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        },
        Ok(Err(e)) => RawOutcome::SpawnFailed(e),
        Err(_elapsed) => RawOutcome::TimedOut,
    }
}

async fn run_skill_subprocess(mut cmd: Command, stdin_json: &str, timeout: Duration) -> RawOutcome {
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return RawOutcome::SpawnFailed(e),
    };
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(stdin_json.as_bytes()).await {
            return RawOutcome::SpawnFailed(e);
        }
        drop(stdin);
    }
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => RawOutcome::Completed {
            status_ok: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        },
        Ok(Err(e)) => RawOutcome::SpawnFailed(e),
        Err(_elapsed) => RawOutcome::TimedOut,
    }
}

fn finalize(
    command: Option<String>,
    raw: RawOutcome,
    sanitizer: &Sanitizer,
    secret_values: &[String],
    output_cap_bytes: usize,
) -> ExecutionResult {
    match raw {
        RawOutcome::Completed { status_ok, stdout, stderr } => {
            let stdout_text = String::from_utf8_lossy(&stdout).into_owned();
            let stderr_text = String::from_utf8_lossy(&stderr).into_owned();
            let output = truncate(
                sanitizer.sanitize(&stdout_text, secret_values.iter().map(String::as_str)),
                output_cap_bytes,
            );
            let stderr = if stderr_text.trim().is_empty() {
                None
            } else {
                Some(truncate(
                    sanitizer.sanitize(&stderr_text, secret_values.iter().map(String::as_str)),
                    output_cap_bytes,
                ))
            };
            ExecutionResult { command, output, stderr, succeeded: status_ok }
        }
        RawOutcome::SpawnFailed(e) => ExecutionResult {
            command,
            output: format!("failed to spawn subprocess: {e}"),
            stderr: None,
            succeeded: false,
        },
        RawOutcome::TimedOut => ExecutionResult {
            command,
            output: "subprocess exceeded its timeout and was killed".to_string(),
            stderr: None,
            succeeded: false,
        },
    }
}
