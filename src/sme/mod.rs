//! Self-modification engine
//!
//! The outer loop: propose bounded patches, dry-run them in isolated
//! worktrees, shadow-evaluate against the Golden Set, filter through safety
//! guards, rank, then canary or commit, with rollback on regression.

pub mod applier;
pub mod canary;
pub mod commit;
pub mod enforcer;
pub mod engine;
pub mod golden;
pub mod guards;
pub mod proposer;
pub mod resources;
pub mod selector;
pub mod shadow;
pub mod smoke;
pub mod storage;
pub mod types;
pub mod worker;

pub use applier::DryRunApplier;
pub use canary::{CanaryDeployment, CanaryManager, CanaryStatus};
pub use commit::CommitManager;
pub use engine::{CycleAction, CycleMode, CycleReport, SelfModEngine};
pub use golden::{load_golden_items, select_golden_subset, GoldenItem};
pub use guards::{check_guards, GuardResult};
pub use proposer::Proposer;
pub use selector::{rank_and_pick, SelectionResult};
pub use shadow::{GoldenPipeline, GoldenRunMetrics, ShadowEvalResult, ShadowEvaluator};
pub use storage::{CommitArtifact, PatchStorage};
pub use types::{ApplyResult, MetaPatch, ProposalResponse, RejectReason};
pub use worker::ImprovementWorker;
