//! `list_posts` / `fetch_posts_by_ids` — spec §4.2.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::DbPool;
use crate::error::StorageError;
use crate::types::Post;

/// All of an expert's posts, newest first, optionally restricted to
/// `authored_at >= cutoff`.
pub async fn list_posts(
    pool: &DbPool,
    expert_id: &str,
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<Post>, StorageError> {
    let rows = match cutoff {
        Some(cutoff) => {
            sqlx::query_as::<_, Post>(
                "SELECT id, expert_id, channel_id, telegram_message_id, authored_at, \
                 author_display, body_markdown, forwarded_from FROM posts \
                 WHERE expert_id = ? AND authored_at >= ? ORDER BY authored_at DESC",
            )
            .bind(expert_id)
            .bind(cutoff)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Post>(
                "SELECT id, expert_id, channel_id, telegram_message_id, authored_at, \
                 author_display, body_markdown, forwarded_from FROM posts \
                 WHERE expert_id = ? ORDER BY authored_at DESC",
            )
            .bind(expert_id)
            .fetch_all(pool)
            .await
        }
    };

    rows.map_err(|e| StorageError::Query { source: e })
}

/// Fetch a specific set of posts by id, scoped to one expert and an
/// optional cutoff. Missing ids are simply absent from the result map.
pub async fn fetch_posts_by_ids(
    pool: &DbPool,
    expert_id: &str,
    ids: &[i64],
    cutoff: Option<DateTime<Utc>>,
) -> Result<HashMap<i64, Post>, StorageError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT id, expert_id, channel_id, telegram_message_id, authored_at, \
         author_display, body_markdown, forwarded_from FROM posts \
         WHERE expert_id = ? AND id IN ({placeholders}){}",
        if cutoff.is_some() { " AND authored_at >= ?" } else { "" }
    );

    let mut query = sqlx::query_as::<_, Post>(&sql).bind(expert_id);
    for id in ids {
        query = query.bind(id);
    }
    if let Some(cutoff) = cutoff {
        query = query.bind(cutoff);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    Ok(rows.into_iter().map(|p| (p.id, p)).collect())
}
