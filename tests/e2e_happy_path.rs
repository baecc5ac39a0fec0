//! Scenario 1 (§8): a trusted user sends a message, the planner emits one
//! `exec` task followed by a closing `msg`, the reviewer approves the exec
//! output, and the plan completes with a delivered message.

mod common;

use common::*;

use kiso::config::Role as AccessRole;
use kiso::types::TaskStatus;

#[tokio::test]
async fn test_happy_path_single_exec_task_completes() {
    let planner_response = planner_json(
        "report disk usage",
        r#"[
            {"type":"exec","detail":"check disk usage","skill":null,"args":null,"expect":"a disk usage report"},
            {"type":"msg","detail":"tell the user the disk usage","skill":null,"args":null,"expect":null}
        ]"#,
    );

    let fixture = build_fixture(
        vec![&planner_response, "df -h", REVIEW_OK, "Disk usage looks healthy."],
        "alice",
    )
    .await;

    let caller = trusted_caller("alice", AccessRole::Admin);
    let response = fixture
        .scheduler
        .ingest("session-happy-path", caller, "how much disk space is left?", None)
        .await
        .expect("ingest should succeed");
    assert!(response.queued);

    let status = wait_for_plan_terminal(&fixture.scheduler, "session-happy-path").await;
    let plan = status.plan.expect("a plan should have been created");
    assert_eq!(plan.status, kiso::types::PlanStatus::Done);
    assert_eq!(plan.parent_id, None);

    assert_eq!(status.tasks.len(), 2);
    assert_eq!(status.tasks[0].index, 1);
    assert_eq!(status.tasks[0].task_type, kiso::types::TaskType::Exec);
    assert_eq!(status.tasks[0].status, TaskStatus::Done);
    assert_eq!(status.tasks[1].index, 2);
    assert_eq!(status.tasks[1].task_type, kiso::types::TaskType::Msg);
    assert_eq!(status.tasks[1].status, TaskStatus::Done);
}

#[tokio::test]
async fn test_happy_path_persists_inbound_and_outbound_messages() {
    let planner_response =
        planner_json("greet the user", r#"[{"type":"msg","detail":"say hi","skill":null,"args":null,"expect":null}]"#);
    let fixture = build_fixture(vec![&planner_response, "Hello there!"], "bob").await;

    let caller = trusted_caller("bob", AccessRole::User);
    fixture.scheduler.ingest("session-greeting", caller, "hi", None).await.expect("ingest should succeed");
    let status = wait_for_plan_terminal(&fixture.scheduler, "session-greeting").await;

    assert_eq!(status.tasks.len(), 1);
    assert_eq!(status.tasks[0].output.as_deref(), Some("Hello there!"));
}
