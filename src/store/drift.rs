//! `load_drift_groups` (spec §4.2) plus the write path used only by the
//! offline Drift Pre-Analyzer (spec §4.13). The core never calls the
//! write functions here; they exist so the analyzer can share the pool
//! bootstrap and row mapping with the read-only Store.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::DbPool;
use crate::error::StorageError;
use crate::types::{DriftAnchor, DriftTopic, Post};

/// Anchor posts with a completed, `has_drift = true` analysis, excluding
/// `exclude_post_ids` (typically the main answer's cited sources) and
/// subject to an optional cutoff on the anchor's authored date.
pub async fn load_drift_groups(
    pool: &DbPool,
    expert_id: &str,
    exclude_post_ids: &[i64],
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<DriftAnchor>, StorageError> {
    let mut sql = String::from(
        "SELECT p.id, p.expert_id, p.channel_id, p.telegram_message_id, p.authored_at, \
         p.author_display, p.body_markdown, p.forwarded_from, d.drift_topics_json \
         FROM drift_records d JOIN posts p ON p.id = d.post_id \
         WHERE d.expert_id = ? AND d.has_drift = 1 AND d.analyzed_by != 'pending'",
    );
    if !exclude_post_ids.is_empty() {
        let placeholders = exclude_post_ids
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND p.id NOT IN ({placeholders})"));
    }
    if cutoff.is_some() {
        sql.push_str(" AND p.authored_at >= ?");
    }
    sql.push_str(" ORDER BY p.authored_at DESC");

    let mut query = sqlx::query(&sql).bind(expert_id);
    for id in exclude_post_ids {
        query = query.bind(id);
    }
    if let Some(cutoff) = cutoff {
        query = query.bind(cutoff);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    let mut groups = Vec::with_capacity(rows.len());
    for row in rows {
        let post = Post {
            id: row.try_get("id").map_err(query_err)?,
            expert_id: row.try_get("expert_id").map_err(query_err)?,
            channel_id: row.try_get("channel_id").map_err(query_err)?,
            telegram_message_id: row.try_get("telegram_message_id").map_err(query_err)?,
            authored_at: row.try_get("authored_at").map_err(query_err)?,
            author_display: row.try_get("author_display").map_err(query_err)?,
            body_markdown: row.try_get("body_markdown").map_err(query_err)?,
            forwarded_from: row.try_get("forwarded_from").map_err(query_err)?,
        };
        let topics_json: String = row.try_get("drift_topics_json").map_err(query_err)?;
        let drift_topics: Vec<DriftTopic> = serde_json::from_str(&topics_json).unwrap_or_default();
        groups.push(DriftAnchor { post, drift_topics });
    }

    Ok(groups)
}

fn query_err(source: sqlx::Error) -> StorageError {
    StorageError::Query { source }
}

/// Posts with no drift record at all, or a record marked `pending` —
/// the analyzer's work queue. Used only by the offline pre-analyzer.
pub async fn posts_needing_drift_analysis(
    pool: &DbPool,
    expert_id: &str,
) -> Result<Vec<i64>, StorageError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT p.id FROM posts p \
         LEFT JOIN drift_records d ON d.post_id = p.id \
         WHERE p.expert_id = ? \
         AND (d.post_id IS NULL OR d.analyzed_by = 'pending') \
         AND EXISTS (SELECT 1 FROM comments c WHERE c.anchor_post_id = p.id)",
    )
    .bind(expert_id)
    .fetch_all(pool)
    .await
    .map_err(query_err)?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Persist a completed drift analysis outcome, upserting over any prior
/// (including `pending`) record for the same post.
pub async fn upsert_drift_record(
    pool: &DbPool,
    post_id: i64,
    expert_id: &str,
    has_drift: bool,
    drift_topics: &[DriftTopic],
    analyzed_by: &str,
) -> Result<(), StorageError> {
    let topics_json = serde_json::to_string(drift_topics).unwrap_or_else(|_| "[]".to_string());
    sqlx::query(
        "INSERT INTO drift_records (post_id, expert_id, has_drift, drift_topics_json, \
         analyzed_at, analyzed_by) VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(post_id) DO UPDATE SET \
         has_drift = excluded.has_drift, drift_topics_json = excluded.drift_topics_json, \
         analyzed_at = excluded.analyzed_at, analyzed_by = excluded.analyzed_by",
    )
    .bind(post_id)
    .bind(expert_id)
    .bind(has_drift)
    .bind(topics_json)
    .bind(Utc::now())
    .bind(analyzed_by)
    .execute(pool)
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Mark an anchor's drift record `pending` because new comments arrived.
/// A no-op if the anchor has no record yet — the next analyzer pass will
/// pick it up via [`posts_needing_drift_analysis`] regardless.
pub async fn mark_pending_for_reanalysis(pool: &DbPool, post_id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE drift_records SET analyzed_by = 'pending' WHERE post_id = ?")
        .bind(post_id)
        .execute(pool)
        .await
        .map_err(query_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_test_db;

    async fn seed_expert_and_post(pool: &DbPool, post_id: i64) {
        sqlx::query("INSERT OR IGNORE INTO experts (id, display_name, channel_handle) VALUES ('e1', 'E1', 'c')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO posts (id, expert_id, channel_id, telegram_message_id, authored_at, \
             author_display, body_markdown) VALUES (?, 'e1', 'chan', ?, ?, 'A', 'body')",
        )
        .bind(post_id)
        .bind(post_id + 100)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn pending_record_excluded_from_load() {
        let pool = init_test_db().await.unwrap();
        seed_expert_and_post(&pool, 1).await;
        upsert_drift_record(&pool, 1, "e1", true, &[], "pending").await.unwrap();

        let groups = load_drift_groups(&pool, "e1", &[], None).await.unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn completed_drift_record_is_loaded_with_topics() {
        let pool = init_test_db().await.unwrap();
        seed_expert_and_post(&pool, 1).await;
        let topics = vec![DriftTopic {
            topic: "Rust async runtimes".into(),
            keywords: vec!["tokio".into()],
            key_phrases: vec!["tokio is faster".into()],
            context: "thread drifted to runtime comparison".into(),
        }];
        upsert_drift_record(&pool, 1, "e1", true, &topics, "analyzer-v1").await.unwrap();

        let groups = load_drift_groups(&pool, "e1", &[], None).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].drift_topics[0].topic, "Rust async runtimes");
    }

    #[tokio::test]
    async fn excluded_post_ids_are_filtered_out() {
        let pool = init_test_db().await.unwrap();
        seed_expert_and_post(&pool, 1).await;
        upsert_drift_record(&pool, 1, "e1", true, &[], "analyzer-v1").await.unwrap();

        let groups = load_drift_groups(&pool, "e1", &[1], None).await.unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn posts_with_no_comments_are_not_queued() {
        let pool = init_test_db().await.unwrap();
        seed_expert_and_post(&pool, 1).await;

        let queue = posts_needing_drift_analysis(&pool, "e1").await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn posts_with_comments_and_no_record_are_queued() {
        let pool = init_test_db().await.unwrap();
        seed_expert_and_post(&pool, 1).await;
        sqlx::query(
            "INSERT INTO comments (anchor_post_id, comment_local_id, author_display, \
             body_markdown, authored_at) VALUES (1, 1, 'C', 'hi', ?)",
        )
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let queue = posts_needing_drift_analysis(&pool, "e1").await.unwrap();
        assert_eq!(queue, vec![1]);
    }

    #[tokio::test]
    async fn mark_pending_is_noop_without_new_comments() {
        let pool = init_test_db().await.unwrap();
        seed_expert_and_post(&pool, 1).await;
        upsert_drift_record(&pool, 1, "e1", false, &[], "analyzer-v1").await.unwrap();

        mark_pending_for_reanalysis(&pool, 2).await.unwrap();
        let groups = load_drift_groups(&pool, "e1", &[], None).await.unwrap();
        assert!(groups.is_empty(), "has_drift=false anchor stays excluded regardless");
    }
}
