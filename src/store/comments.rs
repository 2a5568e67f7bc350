//! `load_comments_for_anchor` — spec §4.2.

use super::DbPool;
use crate::error::StorageError;
use crate::types::Comment;

/// Comments attached to one anchor post, stable order by `comment_local_id`.
pub async fn load_comments_for_anchor(
    pool: &DbPool,
    anchor_post_id: i64,
) -> Result<Vec<Comment>, StorageError> {
    sqlx::query_as::<_, Comment>(
        "SELECT id, anchor_post_id, comment_local_id, author_display, body_markdown, authored_at \
         FROM comments WHERE anchor_post_id = ? ORDER BY comment_local_id ASC",
    )
    .bind(anchor_post_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_test_db;
    use chrono::Utc;

    async fn seed(pool: &DbPool) {
        sqlx::query("INSERT INTO experts (id, display_name, channel_handle) VALUES ('e1', 'E1', 'c')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO posts (id, expert_id, channel_id, telegram_message_id, authored_at, \
             author_display, body_markdown) VALUES (1, 'e1', 'chan', 10, ?, 'A', 'body')",
        )
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
        for local_id in [2i64, 1] {
            sqlx::query(
                "INSERT INTO comments (anchor_post_id, comment_local_id, author_display, \
                 body_markdown, authored_at) VALUES (1, ?, 'C', 'text', ?)",
            )
            .bind(local_id)
            .bind(Utc::now())
            .execute(pool)
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn orders_by_comment_local_id() {
        let pool = init_test_db().await.unwrap();
        seed(&pool).await;

        let comments = load_comments_for_anchor(&pool, 1).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].comment_local_id, 1);
        assert_eq!(comments[1].comment_local_id, 2);
    }
}
