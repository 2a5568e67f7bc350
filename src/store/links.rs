//! `expand_links_1hop` — spec §4.2 / §4.6. DB-only; no LLM involvement.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::DbPool;
use crate::error::StorageError;

/// Returns `seeds` plus every Post linked to or from a seed (either
/// direction, any [`crate::types::LinkType`]), filtered by expert and an
/// optional cutoff.
pub async fn expand_links_1hop(
    pool: &DbPool,
    expert_id: &str,
    seed_post_ids: &[i64],
    cutoff: Option<DateTime<Utc>>,
) -> Result<HashSet<i64>, StorageError> {
    let mut expanded: HashSet<i64> = seed_post_ids.iter().copied().collect();
    if seed_post_ids.is_empty() {
        return Ok(expanded);
    }

    let placeholders = seed_post_ids
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "SELECT l.source_post_id, l.target_post_id FROM links l \
         JOIN posts p_source ON p_source.id = l.source_post_id \
         JOIN posts p_target ON p_target.id = l.target_post_id \
         WHERE p_source.expert_id = ? AND p_target.expert_id = ? \
         AND (l.source_post_id IN ({placeholders}) OR l.target_post_id IN ({placeholders}))"
    );

    let mut query = sqlx::query_as::<_, (i64, i64)>(&sql)
        .bind(expert_id)
        .bind(expert_id);
    for id in seed_post_ids {
        query = query.bind(id);
    }
    for id in seed_post_ids {
        query = query.bind(id);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    for (source, target) in rows {
        expanded.insert(source);
        expanded.insert(target);
    }

    if let Some(cutoff) = cutoff {
        let ids: Vec<i64> = expanded.iter().copied().collect();
        let in_window = posts_within_cutoff(pool, expert_id, &ids, cutoff).await?;
        expanded.retain(|id| in_window.contains(id));
    }

    Ok(expanded)
}

async fn posts_within_cutoff(
    pool: &DbPool,
    expert_id: &str,
    ids: &[i64],
    cutoff: DateTime<Utc>,
) -> Result<HashSet<i64>, StorageError> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT id FROM posts WHERE expert_id = ? AND authored_at >= ? AND id IN ({placeholders})"
    );
    let mut query = sqlx::query_as::<_, (i64,)>(&sql).bind(expert_id).bind(cutoff);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
