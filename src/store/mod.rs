//! Durable relational state: sessions, messages, plans, tasks, facts,
//! learnings, pending items, published files, and deploy-secret metadata.
//!
//! Backed by SQLite via `sqlx`. Migration is applied inline via
//! `include_str!` on first open, mirroring the pattern used by every other
//! SQLite-backed component in this workspace.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::types::{
    Fact, FactCategory, Learning, LearningStatus, Message, MessageRole, PendingItem,
    PendingScope, PendingStatus, Plan, PlanStatus, PublishedFile, Session, Task, TaskStatus,
    TaskType,
};

/// Report produced by [`Store::recover`] describing what startup recovery
/// found and fixed.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Tasks that were `running` and are now `failed`.
    pub tasks_failed: u64,
    /// Plans whose tasks ended in failure and are now `failed`.
    pub plans_failed: u64,
    /// Unprocessed trusted messages re-enqueued, in id order.
    pub messages_to_enqueue: Vec<Message>,
}

impl RecoveryReport {
    /// True iff nothing needed fixing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.tasks_failed == 0 && self.plans_failed == 0 && self.messages_to_enqueue.is_empty()
    }
}

/// The durable state store.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store database at the given path and apply the
    /// schema migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the migration
    /// fails to apply.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration fails to apply.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory store")?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
        let schema = include_str!("migrations/0001_kiso_schema.sql");
        sqlx::raw_sql(schema)
            .execute(pool)
            .await
            .context("failed to apply store schema migration")?;
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Fetch a session by id, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let row: Option<(String, Option<String>, Option<String>, String, i64, String, String)> =
            sqlx::query_as(
                "SELECT id, webhook, connector, summary, cancel_requested, created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch session")?;

        Ok(row.map(
            |(id, webhook, connector, summary, cancel_requested, created_at, updated_at)| Session {
                id,
                webhook,
                connector,
                summary,
                cancel_requested: cancel_requested != 0,
                created_at: parse_ts(&created_at),
                updated_at: parse_ts(&updated_at),
            },
        ))
    }

    /// Create a session if it does not already exist; otherwise a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails for a reason other than an
    /// existing row.
    pub async fn ensure_session(
        &self,
        id: &str,
        webhook: Option<&str>,
        connector: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, webhook, connector, summary, cancel_requested, created_at, updated_at)
             VALUES (?1, ?2, ?3, '', 0, ?4, ?4)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(webhook)
        .bind(connector)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to ensure session")?;
        Ok(())
    }

    /// List all session ids, for `GET /sessions?all=true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_session_ids(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM sessions ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("failed to list sessions")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Set or clear the cancel flag on a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_cancel_requested(&self, session: &str, cancel: bool) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET cancel_requested = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(session)
            .bind(i64::from(cancel))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to set cancel flag")?;
        Ok(())
    }

    /// Replace a session's rolling summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_summary(&self, session: &str, summary: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET summary = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(session)
            .bind(summary)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to update session summary")?;
        Ok(())
    }

    /// Messages (and, for `msg` tasks, their output) created after the
    /// session's last summarization cursor, oldest first — the candidate
    /// batch for step 3 of post-execution hooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn messages_since_summary(&self, session: &str) -> anyhow::Result<Vec<(Message, Option<String>)>> {
        let cursor: (i64,) =
            sqlx::query_as("SELECT last_summarized_message_id FROM sessions WHERE id = ?1")
                .bind(session)
                .fetch_optional(&self.pool)
                .await
                .context("failed to fetch summarization cursor")?
                .unwrap_or((0,));

        let rows: Vec<(i64, String, String, String, String, i64, i64, String, Option<String>)> = sqlx::query_as(
            "SELECT m.id, m.session, m.user, m.role, m.content, m.trusted, m.processed, m.created_at,
                    (SELECT t.output FROM tasks t JOIN plans p ON p.id = t.plan_id
                      WHERE p.message_id = m.id AND t.type = 'msg' AND t.status = 'done'
                      ORDER BY t.id LIMIT 1) AS msg_output
             FROM messages m
             WHERE m.session = ?1 AND m.id > ?2
             ORDER BY m.id",
        )
        .bind(session)
        .bind(cursor.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch messages since last summarization")?;

        Ok(rows
            .into_iter()
            .map(|(id, session, user, role, content, trusted, processed, created_at, msg_output)| {
                (
                    Message {
                        id,
                        session,
                        user,
                        role: str_to_role(&role),
                        content,
                        trusted: trusted != 0,
                        processed: processed != 0,
                        created_at: parse_ts(&created_at),
                    },
                    msg_output,
                )
            })
            .collect())
    }

    /// Advance the session's summarization cursor after folding messages
    /// up to `up_to_message_id` into the rolling summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_summarized(&self, session: &str, up_to_message_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET last_summarized_message_id = ?2 WHERE id = ?1")
            .bind(session)
            .bind(up_to_message_id)
            .execute(&self.pool)
            .await
            .context("failed to advance summarization cursor")?;
        Ok(())
    }

    // ── Messages ─────────────────────────────────────────────────

    /// Insert a new message row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_message(
        &self,
        session: &str,
        user: &str,
        role: MessageRole,
        content: &str,
        trusted: bool,
    ) -> anyhow::Result<i64> {
        let now = Utc::now().to_rfc3339();
        let role_str = role_to_str(role);
        let id = sqlx::query(
            "INSERT INTO messages (session, user, role, content, trusted, processed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        )
        .bind(session)
        .bind(user)
        .bind(role_str)
        .bind(content)
        .bind(i64::from(trusted))
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to insert message")?
        .last_insert_rowid();
        Ok(id)
    }

    /// Mark a message processed (picked up by its session worker).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_message_processed(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE messages SET processed = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to mark message processed")?;
        Ok(())
    }

    /// Fetch unprocessed trusted messages for a session, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_messages(&self, session: &str) -> anyhow::Result<Vec<Message>> {
        self.query_pending_messages(Some(session)).await
    }

    /// Fetch every unprocessed trusted message across all sessions, ordered
    /// by id. Used by startup recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn all_pending_messages(&self) -> anyhow::Result<Vec<Message>> {
        self.query_pending_messages(None).await
    }

    /// Fetch the most recent `limit` messages for a session, in id order
    /// (oldest of the window first). Used for §4.7 context assembly —
    /// trusted messages feed the planner directly, untrusted ones are
    /// paraphrased first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_messages(&self, session: &str, limit: i64) -> anyhow::Result<Vec<Message>> {
        let rows: Vec<(i64, String, String, String, String, i64, i64, String)> = sqlx::query_as(
            "SELECT id, session, user, role, content, trusted, processed, created_at
             FROM messages WHERE session = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(session)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch recent messages")?;

        let mut messages: Vec<Message> = rows
            .into_iter()
            .map(|(id, session, user, role, content, trusted, processed, created_at)| Message {
                id,
                session,
                user,
                role: str_to_role(&role),
                content,
                trusted: trusted != 0,
                processed: processed != 0,
                created_at: parse_ts(&created_at),
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    /// Fetch the `limit` most recent completed `msg` task outputs for a
    /// session, oldest first — the "recent msg outputs" row of the §4.7
    /// context table.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_msg_outputs(&self, session: &str, limit: i64) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT t.output FROM tasks t
             JOIN plans p ON p.id = t.plan_id
             WHERE p.session = ?1 AND t.type = 'msg' AND t.status = 'done' AND t.output IS NOT NULL
             ORDER BY t.id DESC LIMIT ?2",
        )
        .bind(session)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch recent msg outputs")?;
        let mut outputs: Vec<String> = rows.into_iter().map(|(o,)| o).collect();
        outputs.reverse();
        Ok(outputs)
    }

    async fn query_pending_messages(&self, session: Option<&str>) -> anyhow::Result<Vec<Message>> {
        let rows: Vec<(i64, String, String, String, String, i64, i64, String)> = match session {
            Some(s) => {
                sqlx::query_as(
                    "SELECT id, session, user, role, content, trusted, processed, created_at
                     FROM messages
                     WHERE session = ?1 AND trusted = 1 AND processed = 0
                     ORDER BY id",
                )
                .bind(s)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT id, session, user, role, content, trusted, processed, created_at
                     FROM messages
                     WHERE trusted = 1 AND processed = 0
                     ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to query pending messages")?;

        Ok(rows
            .into_iter()
            .map(|(id, session, user, role, content, trusted, processed, created_at)| Message {
                id,
                session,
                user,
                role: str_to_role(&role),
                content,
                trusted: trusted != 0,
                processed: processed != 0,
                created_at: parse_ts(&created_at),
            })
            .collect())
    }

    // ── Plans ────────────────────────────────────────────────────

    /// Create a new plan row in the `running` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create_plan(
        &self,
        session: &str,
        message_id: i64,
        goal: &str,
        parent_id: Option<i64>,
    ) -> anyhow::Result<i64> {
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO plans (session, message_id, goal, status, parent_id, extend_replan,
                                 input_tokens, output_tokens, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', ?4, 0, 0, 0, NULL, ?5, ?5)",
        )
        .bind(session)
        .bind(message_id)
        .bind(goal)
        .bind(parent_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to create plan")?
        .last_insert_rowid();
        Ok(id)
    }

    /// Fetch a plan by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_plan(&self, id: i64) -> anyhow::Result<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, session, message_id, goal, status, parent_id, extend_replan,
                    input_tokens, output_tokens, model, created_at, updated_at
             FROM plans WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch plan")?;
        Ok(row.map(PlanRow::into_plan))
    }

    /// Fetch the most recently created plan for a session, if any — the
    /// plan `/status` and `/cancel` report against.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn latest_plan_for_session(&self, session: &str) -> anyhow::Result<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, session, message_id, goal, status, parent_id, extend_replan,
                    input_tokens, output_tokens, model, created_at, updated_at
             FROM plans WHERE session = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(session)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch latest plan for session")?;
        Ok(row.map(PlanRow::into_plan))
    }

    /// Set a plan's terminal (or still-running) status.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_plan_status(&self, id: i64, status: PlanStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE plans SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(plan_status_to_str(status))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to update plan status")?;
        Ok(())
    }

    /// Record token usage and the model used for a plan's planner call.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn record_plan_usage(
        &self,
        id: i64,
        input_tokens: i64,
        output_tokens: i64,
        model: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE plans SET input_tokens = input_tokens + ?2, output_tokens = output_tokens + ?3,
                    model = ?4, updated_at = ?5 WHERE id = ?1",
        )
        .bind(id)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(model)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to record plan usage")?;
        Ok(())
    }

    /// Grant additional replan depth to a plan (capped by the caller against
    /// configured `max_extend_replan`).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_extend_replan(&self, id: i64, extra: u8) -> anyhow::Result<()> {
        sqlx::query("UPDATE plans SET extend_replan = ?2 WHERE id = ?1")
            .bind(id)
            .bind(i64::from(extra))
            .execute(&self.pool)
            .await
            .context("failed to set extend_replan")?;
        Ok(())
    }

    // ── Tasks ────────────────────────────────────────────────────

    /// Insert a plan's tasks in order. Returns the assigned row ids, in the
    /// same order as `tasks`.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails.
    pub async fn insert_tasks(
        &self,
        plan_id: i64,
        tasks: &[NewTask<'_>],
    ) -> anyhow::Result<Vec<i64>> {
        let now = Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(tasks.len());
        for t in tasks {
            let id = sqlx::query(
                "INSERT INTO tasks (plan_id, idx, type, detail, skill, args, expect, command,
                                     status, output, stderr, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 'pending', NULL, NULL, ?8, ?8)",
            )
            .bind(plan_id)
            .bind(i64::from(t.index))
            .bind(task_type_to_str(t.task_type))
            .bind(t.detail)
            .bind(t.skill)
            .bind(t.args)
            .bind(t.expect)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("failed to insert task")?
            .last_insert_rowid();
            ids.push(id);
        }
        Ok(ids)
    }

    /// Fetch all tasks for a plan, in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn tasks_for_plan(&self, plan_id: i64) -> anyhow::Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, plan_id, idx, type, detail, skill, args, expect, command, status,
                    output, stderr, created_at, updated_at
             FROM tasks WHERE plan_id = ?1 ORDER BY idx",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch tasks for plan")?;
        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    /// Transition a task to `running`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn start_task(&self, id: i64, command: Option<&str>) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'running', command = COALESCE(?2, command), updated_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(command)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to start task")?;
        Ok(())
    }

    /// Record a task's terminal result.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        output: Option<&str>,
        stderr: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?2, output = ?3, stderr = ?4, updated_at = ?5 WHERE id = ?1",
        )
        .bind(id)
        .bind(task_status_to_str(status))
        .bind(output)
        .bind(stderr)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to finish task")?;
        Ok(())
    }

    /// Cancel every task in a plan still `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn cancel_pending_tasks(&self, plan_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'cancelled', updated_at = ?2
             WHERE plan_id = ?1 AND status = 'pending'",
        )
        .bind(plan_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to cancel pending tasks")?;
        Ok(())
    }

    /// Fail every task in a plan still `pending` (§4.2 replan branch:
    /// "mark the current plan failed, remaining tasks failed").
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn fail_pending_tasks(&self, plan_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'failed', updated_at = ?2
             WHERE plan_id = ?1 AND status = 'pending'",
        )
        .bind(plan_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to fail pending tasks")?;
        Ok(())
    }

    // ── Facts ────────────────────────────────────────────────────

    /// Insert a new fact.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_fact(
        &self,
        content: &str,
        category: FactCategory,
        confidence: f64,
        session: &str,
    ) -> anyhow::Result<i64> {
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO facts (content, category, confidence, use_count, last_used, session, created_at)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?5)",
        )
        .bind(content)
        .bind(fact_category_to_str(category))
        .bind(confidence)
        .bind(session)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to insert fact")?
        .last_insert_rowid();
        Ok(id)
    }

    /// Fetch facts visible to a session: all `project`/`tool`/`general`
    /// facts, plus `user` facts scoped to this session, ordered by
    /// descending confidence.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn facts_visible_to(&self, session: &str) -> anyhow::Result<Vec<Fact>> {
        let rows: Vec<FactRow> = sqlx::query_as(
            "SELECT id, content, category, confidence, use_count, last_used, session, created_at
             FROM facts
             WHERE category != 'user' OR session = ?1
             ORDER BY confidence DESC",
        )
        .bind(session)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch visible facts")?;
        Ok(rows.into_iter().map(FactRow::into_fact).collect())
    }

    /// Bump a fact's use count and last-used timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn record_fact_use(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE facts SET use_count = use_count + 1, last_used = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to record fact use")?;
        Ok(())
    }

    /// Apply decay to a fact's confidence and archive it if it falls below
    /// `archive_threshold`. Returns true if the fact was archived.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn decay_and_maybe_archive_fact(
        &self,
        id: i64,
        new_confidence: f64,
        archive_threshold: f64,
        reason: &str,
    ) -> anyhow::Result<bool> {
        if new_confidence < archive_threshold {
            let row: Option<FactRow> = sqlx::query_as(
                "SELECT id, content, category, confidence, use_count, last_used, session, created_at
                 FROM facts WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch fact for archival")?;

            let Some(row) = row else { return Ok(false) };
            let now = Utc::now().to_rfc3339();

            let mut tx = self.pool.begin().await.context("failed to begin archive tx")?;
            sqlx::query(
                "INSERT INTO facts_archive (id, content, category, confidence, use_count, last_used,
                                             session, created_at, archived_at, archive_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(row.0)
            .bind(&row.1)
            .bind(&row.2)
            .bind(new_confidence)
            .bind(row.4)
            .bind(&row.5)
            .bind(&row.6)
            .bind(&row.7)
            .bind(&now)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .context("failed to insert archived fact")?;

            sqlx::query("DELETE FROM facts WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("failed to delete archived fact")?;

            tx.commit().await.context("failed to commit fact archival")?;
            Ok(true)
        } else {
            sqlx::query("UPDATE facts SET confidence = ?2 WHERE id = ?1")
                .bind(id)
                .bind(new_confidence)
                .execute(&self.pool)
                .await
                .context("failed to apply fact decay")?;
            Ok(false)
        }
    }

    // ── Learnings ────────────────────────────────────────────────

    /// Insert a candidate learning in the `pending` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_learning(&self, content: &str, session: &str) -> anyhow::Result<i64> {
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO learnings (content, session, status, reason, created_at)
             VALUES (?1, ?2, 'pending', NULL, ?3)",
        )
        .bind(content)
        .bind(session)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to insert learning")?
        .last_insert_rowid();
        Ok(id)
    }

    /// Fetch all `pending` learnings, for curator review.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_learnings(&self) -> anyhow::Result<Vec<Learning>> {
        let rows: Vec<LearningRow> = sqlx::query_as(
            "SELECT id, content, session, status, reason, created_at
             FROM learnings WHERE status = 'pending' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch pending learnings")?;
        Ok(rows.into_iter().map(LearningRow::into_learning).collect())
    }

    /// Dispose of a learning: promote to a fact, mark asked, or discard.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_learning_status(
        &self,
        id: i64,
        status: LearningStatus,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE learnings SET status = ?2, reason = ?3 WHERE id = ?1")
            .bind(id)
            .bind(learning_status_to_str(status))
            .bind(reason)
            .execute(&self.pool)
            .await
            .context("failed to set learning status")?;
        Ok(())
    }

    // ── Pending items ────────────────────────────────────────────

    /// Insert an open pending item (curator "ask" verdict).
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_pending_item(
        &self,
        scope: PendingScope,
        session: Option<&str>,
        question: &str,
    ) -> anyhow::Result<i64> {
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO pending_items (scope, session, question, status, created_at)
             VALUES (?1, ?2, ?3, 'open', ?4)",
        )
        .bind(pending_scope_to_str(scope))
        .bind(session)
        .bind(question)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to insert pending item")?
        .last_insert_rowid();
        Ok(id)
    }

    /// Fetch open pending items visible to a session (global, plus this
    /// session's own).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn open_pending_items(&self, session: &str) -> anyhow::Result<Vec<PendingItem>> {
        let rows: Vec<PendingItemRow> = sqlx::query_as(
            "SELECT id, scope, session, question, status, created_at
             FROM pending_items
             WHERE status = 'open' AND (scope = 'global' OR session = ?1)
             ORDER BY id",
        )
        .bind(session)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch open pending items")?;
        Ok(rows.into_iter().map(PendingItemRow::into_item).collect())
    }

    /// Resolve a pending item.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_pending_item_status(
        &self,
        id: i64,
        status: PendingStatus,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE pending_items SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(pending_status_to_str(status))
            .execute(&self.pool)
            .await
            .context("failed to set pending item status")?;
        Ok(())
    }

    // ── Published files ──────────────────────────────────────────

    /// Register a published file token.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_published_file(
        &self,
        id: &str,
        session: &str,
        filename: &str,
        relative_path: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO published_files (id, session, filename, relative_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(session)
        .bind(filename)
        .bind(relative_path)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert published file")?;
        Ok(())
    }

    /// Resolve a published file token to its record.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_published_file(&self, id: &str) -> anyhow::Result<Option<PublishedFile>> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, session, filename, relative_path, created_at
             FROM published_files WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch published file")?;
        Ok(row.map(|(id, session, filename, relative_path, created_at)| PublishedFile {
            id,
            session,
            filename,
            relative_path,
            created_at: parse_ts(&created_at),
        }))
    }

    // ── Deploy secrets (metadata only — values never persisted) ────

    /// Record that a deploy secret key was loaded, for audit/listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn record_deploy_secret_loaded(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO deploy_secrets (key, loaded_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET loaded_at = ?2",
        )
        .bind(key)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to record deploy secret")?;
        Ok(())
    }

    // ── Crash recovery ───────────────────────────────────────────

    /// Run startup recovery: fail any task left `running`, fail any plan
    /// whose tasks end in failure, and collect unprocessed trusted messages
    /// to re-enqueue.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the recovery queries fail.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        let now = Utc::now().to_rfc3339();

        let tasks_failed = sqlx::query(
            "UPDATE tasks SET status = 'failed', updated_at = ?1 WHERE status = 'running'",
        )
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to fail running tasks")?
        .rows_affected();

        let plans_failed = sqlx::query(
            "UPDATE plans SET status = 'failed', updated_at = ?1
             WHERE status = 'running'
               AND id IN (
                   SELECT DISTINCT plan_id FROM tasks WHERE status = 'failed'
               )",
        )
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to fail plans with failed tasks")?
        .rows_affected();

        let messages_to_enqueue = self.all_pending_messages().await?;

        Ok(RecoveryReport { tasks_failed, plans_failed, messages_to_enqueue })
    }
}

/// A task to be inserted as part of a freshly planned (or replanned) list.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub index: u32,
    pub task_type: TaskType,
    pub detail: &'a str,
    pub skill: Option<&'a str>,
    pub args: Option<&'a str>,
    pub expect: Option<&'a str>,
}

// ── Row conversion helpers ──────────────────────────────────────

type PlanRow = (
    i64,
    String,
    i64,
    String,
    String,
    Option<i64>,
    i64,
    i64,
    i64,
    Option<String>,
    String,
    String,
);

trait IntoPlan {
    fn into_plan(self) -> Plan;
}

impl IntoPlan for PlanRow {
    fn into_plan(self) -> Plan {
        let (
            id,
            session,
            message_id,
            goal,
            status,
            parent_id,
            extend_replan,
            input_tokens,
            output_tokens,
            model,
            created_at,
            updated_at,
        ) = self;
        Plan {
            id,
            session,
            message_id,
            goal,
            status: str_to_plan_status(&status),
            parent_id,
            extend_replan: u8::try_from(extend_replan).unwrap_or(0),
            input_tokens,
            output_tokens,
            model,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        }
    }
}

type TaskRow = (
    i64,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

trait IntoTask {
    fn into_task(self) -> Task;
}

impl IntoTask for TaskRow {
    fn into_task(self) -> Task {
        let (
            id,
            plan_id,
            idx,
            task_type,
            detail,
            skill,
            args,
            expect,
            command,
            status,
            output,
            stderr,
            created_at,
            updated_at,
        ) = self;
        Task {
            id,
            plan_id,
            index: u32::try_from(idx).unwrap_or(0),
            task_type: str_to_task_type(&task_type),
            detail,
            skill,
            args,
            expect,
            command,
            status: str_to_task_status(&status),
            output,
            stderr,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        }
    }
}

type FactRow = (i64, String, String, f64, i64, Option<String>, String, String);

trait IntoFact {
    fn into_fact(self) -> Fact;
}

impl IntoFact for FactRow {
    fn into_fact(self) -> Fact {
        let (id, content, category, confidence, use_count, last_used, session, created_at) = self;
        Fact {
            id,
            content,
            category: str_to_fact_category(&category),
            confidence,
            use_count,
            last_used: last_used.as_deref().map(parse_ts),
            session,
            created_at: parse_ts(&created_at),
        }
    }
}

type LearningRow = (i64, String, String, String, Option<String>, String);

trait IntoLearning {
    fn into_learning(self) -> Learning;
}

impl IntoLearning for LearningRow {
    fn into_learning(self) -> Learning {
        let (id, content, session, status, reason, created_at) = self;
        Learning {
            id,
            content,
            session,
            status: str_to_learning_status(&status),
            reason,
            created_at: parse_ts(&created_at),
        }
    }
}

type PendingItemRow = (i64, String, Option<String>, String, String, String);

trait IntoPendingItem {
    fn into_item(self) -> PendingItem;
}

impl IntoPendingItem for PendingItemRow {
    fn into_item(self) -> PendingItem {
        let (id, scope, session, question, status, created_at) = self;
        PendingItem {
            id,
            scope: str_to_pending_scope(&scope),
            session,
            question,
            status: str_to_pending_status(&status),
            created_at: parse_ts(&created_at),
        }
    }
}

fn parse_ts(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn role_to_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

fn str_to_role(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        "system" => MessageRole::System,
        _ => MessageRole::User,
    }
}

fn plan_status_to_str(s: PlanStatus) -> &'static str {
    match s {
        PlanStatus::Running => "running",
        PlanStatus::Done => "done",
        PlanStatus::Failed => "failed",
        PlanStatus::Cancelled => "cancelled",
    }
}

fn str_to_plan_status(s: &str) -> PlanStatus {
    match s {
        "done" => PlanStatus::Done,
        "failed" => PlanStatus::Failed,
        "cancelled" => PlanStatus::Cancelled,
        _ => PlanStatus::Running,
    }
}

fn task_type_to_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Exec => "exec",
        TaskType::Skill => "skill",
        TaskType::Msg => "msg",
        TaskType::Search => "search",
        TaskType::Replan => "replan",
    }
}

fn str_to_task_type(s: &str) -> TaskType {
    match s {
        "skill" => TaskType::Skill,
        "msg" => TaskType::Msg,
        "search" => TaskType::Search,
        "replan" => TaskType::Replan,
        _ => TaskType::Exec,
    }
}

fn task_status_to_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Done => "done",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn str_to_task_status(s: &str) -> TaskStatus {
    match s {
        "running" => TaskStatus::Running,
        "done" => TaskStatus::Done,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Pending,
    }
}

fn fact_category_to_str(c: FactCategory) -> &'static str {
    match c {
        FactCategory::Project => "project",
        FactCategory::User => "user",
        FactCategory::Tool => "tool",
        FactCategory::General => "general",
    }
}

fn str_to_fact_category(s: &str) -> FactCategory {
    match s {
        "user" => FactCategory::User,
        "tool" => FactCategory::Tool,
        "general" => FactCategory::General,
        _ => FactCategory::Project,
    }
}

fn learning_status_to_str(s: LearningStatus) -> &'static str {
    match s {
        LearningStatus::Pending => "pending",
        LearningStatus::Promoted => "promoted",
        LearningStatus::Asked => "asked",
        LearningStatus::Discarded => "discarded",
    }
}

fn str_to_learning_status(s: &str) -> LearningStatus {
    match s {
        "promoted" => LearningStatus::Promoted,
        "asked" => LearningStatus::Asked,
        "discarded" => LearningStatus::Discarded,
        _ => LearningStatus::Pending,
    }
}

fn pending_scope_to_str(s: PendingScope) -> &'static str {
    match s {
        PendingScope::Global => "global",
        PendingScope::Session => "session",
    }
}

fn str_to_pending_scope(s: &str) -> PendingScope {
    match s {
        "session" => PendingScope::Session,
        _ => PendingScope::Global,
    }
}

fn pending_status_to_str(s: PendingStatus) -> &'static str {
    match s {
        PendingStatus::Open => "open",
        PendingStatus::Answered => "answered",
        PendingStatus::Dropped => "dropped",
    }
}

fn str_to_pending_status(s: &str) -> PendingStatus {
    match s {
        "answered" => PendingStatus::Answered,
        "dropped" => PendingStatus::Dropped,
        _ => PendingStatus::Open,
    }
}
