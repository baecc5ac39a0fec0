//! Scenario 6 (§8): a planner-emitted ephemeral secret that later shows up
//! verbatim in a task's real stdout must never survive into persisted
//! task output — the sanitizer redacts it before `finish_task`.

mod common;

use common::*;

use kiso::config::Role as AccessRole;
use kiso::sanitizer::REDACTION_MARKER;

const SECRET_VALUE: &str = "hunter2-db-password";

#[tokio::test]
async fn test_ephemeral_secret_is_redacted_from_persisted_task_output() {
    let planner_response = planner_json_with_secret(
        "look up the database password",
        r#"[
            {"type":"exec","detail":"print the database password","skill":null,"args":null,"expect":"the database password"},
            {"type":"msg","detail":"confirm it was printed","skill":null,"args":null,"expect":null}
        ]"#,
        "db_password",
        SECRET_VALUE,
    );

    // The exec translator's response is a real shell command that echoes
    // the secret to stdout, exactly as a misbehaving or overly-literal
    // translation might.
    let exec_command = format!("echo {SECRET_VALUE}");

    let fixture =
        build_fixture(vec![&planner_response, &exec_command, REVIEW_OK, "The password was printed."], "frank").await;

    let caller = trusted_caller("frank", AccessRole::Admin);
    fixture
        .scheduler
        .ingest("session-secret-leak", caller, "print the database password", None)
        .await
        .expect("ingest should succeed");

    let status = wait_for_plan_terminal(&fixture.scheduler, "session-secret-leak").await;
    let plan = status.plan.expect("a plan should exist");
    assert_eq!(plan.status, kiso::types::PlanStatus::Done);

    let exec_output = status.tasks[0].output.as_deref().expect("exec task should have output");
    assert!(!exec_output.contains(SECRET_VALUE), "raw secret value leaked into persisted task output");
    assert!(exec_output.contains(REDACTION_MARKER), "sanitized output should carry the redaction marker");
}
