//! `list_experts` — spec §4.2.

use super::DbPool;
use crate::error::StorageError;
use crate::types::Expert;

pub async fn list_experts(pool: &DbPool) -> Result<Vec<Expert>, StorageError> {
    sqlx::query_as::<_, Expert>("SELECT id, display_name, channel_handle FROM experts ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

pub async fn get_expert(pool: &DbPool, expert_id: &str) -> Result<Option<Expert>, StorageError> {
    sqlx::query_as::<_, Expert>(
        "SELECT id, display_name, channel_handle FROM experts WHERE id = ?",
    )
    .bind(expert_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_test_db;

    async fn seed(pool: &DbPool) {
        sqlx::query("INSERT INTO experts (id, display_name, channel_handle) VALUES (?, ?, ?)")
            .bind("e1")
            .bind("Expert One")
            .bind("expert_one_channel")
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lists_experts() {
        let pool = init_test_db().await.unwrap();
        seed(&pool).await;
        let experts = list_experts(&pool).await.unwrap();
        assert_eq!(experts.len(), 1);
        assert_eq!(experts[0].id, "e1");
    }

    #[tokio::test]
    async fn get_missing_expert_returns_none() {
        let pool = init_test_db().await.unwrap();
        assert!(get_expert(&pool, "missing").await.unwrap().is_none());
    }
}
