//! The eight-stage per-expert query pipeline (spec §4.4-§4.10) plus the
//! Per-Expert Orchestrator (§4.11) that sequences them.

pub mod comment_group;
pub mod comment_synthesis;
pub mod language_check;
pub mod map;
pub mod medium_rescue;
pub mod orchestrator;
pub mod reduce;
pub mod resolve;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::LlmGateway;
use crate::store::DbPool;

/// Handles every stage needs: the Gateway, the Store pool, and resolved
/// config. Cheap to clone — every field is already a pool handle or `Arc`.
#[derive(Clone)]
pub struct StageContext {
    pub gateway: Arc<dyn LlmGateway>,
    pub pool: DbPool,
    pub config: AppConfig,
}

/// Truncate a post body to a safe per-snippet character budget so a chunk
/// prompt stays within its total token budget regardless of how verbose
/// any single post is. Character count, not a tokenizer count — good
/// enough for a budget that exists to bound worst-case prompt size, not to
/// hit an exact token target.
pub fn truncate_snippet(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(max_chars).collect();
    truncated.push_str("\u{2026}");
    truncated
}
