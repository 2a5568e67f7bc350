//! DB-only 1-hop link expansion over HIGH posts (spec §4.6). No LLM
//! involvement — "trust the author's own links" gives near-perfect
//! precision; deeper hops risk topic drift. MEDIUM-selected posts bypass
//! this stage entirely by design.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::StageContext;
use crate::error::StorageError;
use crate::store;

/// HIGH posts plus their 1-hop linked posts (any link type, either
/// direction), subject to an optional cutoff.
pub async fn run_resolve(
    ctx: &StageContext,
    expert_id: &str,
    high_post_ids: &[i64],
    cutoff: Option<DateTime<Utc>>,
) -> Result<HashSet<i64>, StorageError> {
    store::links::expand_links_1hop(&ctx.pool, expert_id, high_post_ids, cutoff).await
}
