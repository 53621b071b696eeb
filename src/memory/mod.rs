//! Episodic memory
//!
//! Stores high-reward evolution experiences and feeds them back into future
//! runs as an "evolutionary seed" primer.

pub mod retriever;
pub mod store;

pub use retriever::build_memory_primer;
pub use store::{normalize_task_class, Experience, MemoryStore};
