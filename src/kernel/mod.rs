//! Kernel: the trusted computing base that turns an inbound message into
//! a plan, runs that plan's tasks, and folds the results back into the
//! session's durable state.
//!
//! - `scheduler`: per-session worker pool (§4.1) — the only entry point
//!   an outer transport layer needs.
//! - `plan`:      plan runtime state machine (§4.2-4.5).
//! - `executor`:  task execution backends — exec/skill/msg/search (§4.4).
//! - `roles`:     LLM role pipelines (planner, reviewer, curator, and the
//!   free-form roles) and their shared context assembly.
//! - `policy`:    destructive-command screening and exec identity.
//! - `audit`:     append-only JSONL audit log.
//! - `egress`:    webhook delivery with retry.
//! - `template`:  per-role prompt templates, editable on disk.
//! - `hooks`:     post-execution housekeeping (§4.6).

pub mod audit;
pub mod egress;
pub mod executor;
pub mod hooks;
pub mod plan;
pub mod policy;
pub mod roles;
pub mod scheduler;
pub mod template;
