//! # Curricle: resumable curriculum-generation workflow orchestrator
//!
//! Curricle turns a learning goal into a multi-stage generated curriculum
//! (framework → human review → per-concept content). This crate is the
//! orchestration core only: a checkpointed state machine with edit-and-retry
//! loops, a suspend/resume human-review gate, a pool of content workers fed
//! through a durable work-unit queue, and a reconciler for tasks left behind
//! by dead workers. LLM prompting and retrieval are opaque collaborators
//! behind the [`agents`] seams.
//!
//! ## Architecture
//!
//! - [`types`] — status and identifier enums with stable string encodings
//! - [`state`] — [`WorkflowState`](state::WorkflowState) and the
//!   carry-forward [`StateDelta`](state::StateDelta) merge contract
//! - [`graph`] — the static node table and the pure
//!   [`Router`](graph::Router)
//! - [`node`] / [`nodes`] — the uniform runner contract and the concrete
//!   analyze/design/validate/edit steps
//! - [`engine`] — checkpointed traversal: advance, suspend, resume, cancel
//! - [`checkpoint`] / [`checkpoint_sqlite`] — append-only state snapshots
//! - [`registry`] / [`registry_sqlite`] — task and work-unit rows with
//!   status-guarded conditional updates
//! - [`dispatch`] — work-unit queue, dispatcher, content-worker pool
//! - [`bus`] — per-task progress pub/sub with history replay
//! - [`review`] — the human-review suspend/resume boundary
//! - [`reconcile`] — stale-task detection and repair
//! - [`api`] — minimal axum surface over all of the above
//!
//! ## Execution model
//!
//! One node executes at a time per task; every step ends with a checkpoint
//! whose `node` field is the resume point. Suspension never holds a thread:
//! the review gate persists and returns, and an external decision re-enters
//! the graph through a status-guarded update that admits exactly one winner.
//! After dispatch the graph thread for the task is done — the last content
//! worker to resolve a unit finalizes the task.

pub mod agents;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod reconcile;
pub mod registry;
pub mod review;
pub mod state;
pub mod telemetry;
pub mod types;

#[cfg(feature = "http")]
pub mod api;
#[cfg(feature = "sqlite")]
pub mod checkpoint_sqlite;
#[cfg(feature = "sqlite")]
pub mod registry_sqlite;
