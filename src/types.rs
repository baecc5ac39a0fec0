//! Core data model: Session, Message, Plan, Task, Fact, Learning, and the
//! supporting value types shared across the store, runtime, and role
//! pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Matches a session identifier: `^[A-Za-z0-9_@.-]{1,255}$`.
pub const SESSION_ID_PATTERN: &str = r"^[A-Za-z0-9_@.\-]{1,255}$";

/// Validate a session identifier against the required pattern.
///
/// Implemented by hand rather than via `regex` so that it can run on the
/// hot ingest path without compiling a pattern per call; the character
/// class mirrors `SESSION_ID_PATTERN` exactly.
#[must_use]
pub fn is_valid_session_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 255 {
        return false;
    }
    id.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'_' | b'@' | b'.' | b'-')
    })
}

/// A session: one conversation between one connector/user pair and Kiso.
///
/// Created implicitly on first message or explicitly by a connector.
/// Never deleted except by admin reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Caller-chosen identifier, matching [`SESSION_ID_PATTERN`].
    pub id: String,
    /// Webhook URL to POST `msg` deliveries to, if configured.
    pub webhook: Option<String>,
    /// Connector name derived from the ingesting token.
    pub connector: Option<String>,
    /// Rolling four-section summary (Session Summary, Key Decisions, Open
    /// Questions, Working Knowledge).
    pub summary: String,
    /// Atomic cancel flag for the in-flight plan, if any.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role of a message in the session transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A single inbound or outbound message row.
///
/// Invariant: a message is enqueued for processing iff
/// `trusted && !processed`. On startup all such messages are re-enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic id.
    pub id: i64,
    pub session: String,
    /// Resolved Linux name or raw external identity of the sender.
    pub user: String,
    pub role: MessageRole,
    pub content: String,
    /// True iff the sender is whitelisted in configuration.
    pub trusted: bool,
    /// False until picked up by the session worker.
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Terminal plan states are final; `Running` is the only non-terminal one.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A plan: an ordered list of tasks produced by the planner for one
/// originating message, with a terminal lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub session: String,
    pub message_id: i64,
    pub goal: String,
    pub status: PlanStatus,
    /// Set when this plan was produced by a replan of an earlier plan.
    pub parent_id: Option<i64>,
    /// Additional replan depth granted by the planner (0..3), consumed by
    /// the replan-depth check.
    pub extend_replan: u8,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task type, a sum type over the wire's tagged-but-nullable-fields shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Exec,
    Skill,
    Msg,
    Search,
    Replan,
}

impl TaskType {
    /// `exec`, `skill`, `search` require a non-null `expect`; `msg` and
    /// `replan` forbid one.
    #[must_use]
    pub fn requires_expect(self) -> bool {
        matches!(self, Self::Exec | Self::Skill | Self::Search)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// One executable step within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub plan_id: i64,
    /// 1-based index within the plan; indices are dense.
    pub index: u32,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub detail: String,
    pub skill: Option<String>,
    /// Raw JSON string, validated against the skill's declared arg schema.
    pub args: Option<String>,
    /// Planner-declared success criterion, required for
    /// exec/skill/search, forbidden on msg/replan.
    pub expect: Option<String>,
    /// Exec translator output, persisted once produced.
    pub command: Option<String>,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub stderr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry in the in-memory plan-outputs array threaded between tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutputEntry {
    pub index: u32,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub detail: String,
    pub output: String,
    pub status: TaskStatus,
}

/// Visibility scope of a [`Fact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    Project,
    User,
    Tool,
    General,
}

impl FactCategory {
    /// `project`/`tool`/`general` are globally visible; `user` is visible
    /// only within its originating session.
    #[must_use]
    pub fn is_session_scoped(self) -> bool {
        matches!(self, Self::User)
    }
}

/// A remembered fact, subject to confidence decay and archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub content: String,
    pub category: FactCategory,
    pub confidence: f64,
    pub use_count: i64,
    pub last_used: Option<DateTime<Utc>>,
    /// Originating session, for provenance and `user`-scope visibility.
    pub session: String,
    pub created_at: DateTime<Utc>,
}

/// Status of a reviewer-emitted learning awaiting curator disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    Pending,
    Promoted,
    Asked,
    Discarded,
}

/// A candidate fact produced by the reviewer, pending curator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: i64,
    pub content: String,
    pub session: String,
    pub status: LearningStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Scope of a [`PendingItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingScope {
    Global,
    Session,
}

/// Status of a [`PendingItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Open,
    Answered,
    Dropped,
}

/// A question emitted by the curator's "ask" verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItem {
    pub id: i64,
    pub scope: PendingScope,
    pub session: Option<String>,
    pub question: String,
    pub status: PendingStatus,
    pub created_at: DateTime<Utc>,
}

/// A file published under a session's `pub/` directory, addressable by an
/// unauthenticated URL token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedFile {
    /// UUID4 token, looked up by exact string match against an indexed column.
    pub id: String,
    pub session: String,
    pub filename: String,
    /// Path relative to the session workspace's `pub/` directory; always a
    /// bare filename, never containing a path separator.
    pub relative_path: String,
    pub created_at: DateTime<Utc>,
}

/// An ephemeral secret emitted by the planner, held only in the owning
/// worker's in-memory map.
///
/// Never implements `Serialize`/persistence — by invariant 10 it must
/// never reach any row of the persistent store.
#[derive(Debug, Clone)]
pub struct EphemeralSecret {
    pub key: String,
    pub value: String,
}
