//! Read-only context sources for the evolution runner.

pub mod rag;
pub mod web;

pub use rag::{ChunkIndex, RagHit, Retriever};
pub use web::{HttpWebSearch, WebHit, WebProvider};

/// Stitch context snippets into one block, mirroring the prompt layout the
/// plan assembler expects.
pub fn stitch_context(rag_snips: &[String], mem_snips: &[String], web_snips: &[String]) -> String {
    let mut blocks = Vec::new();
    if !rag_snips.is_empty() {
        blocks.push(format!("RAG:\n{}", rag_snips.join("\n---\n")));
    }
    if !mem_snips.is_empty() {
        blocks.push(format!("Memory:\n{}", mem_snips.join("\n---\n")));
    }
    if !web_snips.is_empty() {
        blocks.push(format!("Web:\n{}", web_snips.join("\n---\n")));
    }
    blocks.join("\n\n")
}
