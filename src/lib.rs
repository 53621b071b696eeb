//! Meta-evolution engine for language-model prompting
//!
//! An inner loop evolves prompting recipes per task with a bandit over
//! mutation operators, scored by a two-judge AI panel blended with semantic
//! similarity and shaped by process/cost rewards. High-reward outcomes feed
//! an episodic memory that primes future runs. An outer self-modification
//! loop proposes bounded patches to the engine itself, dry-runs them in
//! isolated worktrees, shadow-evaluates them against a Golden Set, and
//! canaries or commits the survivors.

pub mod config;
pub mod embed;
pub mod engine;
pub mod judge;
pub mod memory;
pub mod meta;
pub mod realtime;
pub mod sme;
pub mod tools;

// Re-exports for convenience
pub use config::Config;
pub use engine::{EngineGateway, EngineKind};
pub use meta::{EvolutionService, RunFlags, RunResult};
pub use realtime::RealtimeHub;
