// # -----------------------------
// # crates/engine/src/lib.rs
// # -----------------------------
//! Persistent repository mirrors and the transactional edit engine on top
//! of them.
//!
//! Data flows top-down: [`workflow`] drives [`batch`], which uses [`text`]
//! and [`patch`] against mirrors owned by [`lifecycle`] and [`store`].
//! [`sandbox`] runs commands inside the same mirrors.

pub mod batch;
pub mod config;
pub mod diff;
pub mod errors;
pub mod git;
pub mod lifecycle;
pub mod patch;
pub mod patch_parser;
pub mod path_security;
pub mod sandbox;
pub mod store;
pub mod text;
pub mod workflow;

pub use batch::{
    parse_operations, run_batch, BatchExecutor, BatchPlan, BatchResult, BatchState, BatchStatus,
    BatchSummary, EditOperation, OperationOutcome, OperationStatus, PatchInput,
};
pub use config::CoreConfig;
pub use diff::{compare, make_diff, DiffLimits, DiffResult, DiffSource};
pub use errors::{ErrorCategory, MirrorError, MirrorResult};
pub use lifecycle::{
    CheckoutOutcome, EnsureOutcome, Mirror, MirrorHandle, MirrorManager, MirrorStatus, SyncAction,
};
pub use patch::{apply_patch, ApplyOptions, PatchOutcome};
pub use path_security::MirrorPaths;
pub use sandbox::{CommandExecution, CommandRequest, EnvMode, Sandbox};
pub use store::{MirrorKey, MirrorRecord, MirrorStore};
pub use text::{LineOp, MatchOptions, Occurrence, Position};
pub use workflow::{
    Orchestrator, PullRequest, PullRequestDraft, PullRequestGateway, RetryPolicy, StepRecord,
    StepStatus, WorkflowOutcome, WorkflowRequest,
};
