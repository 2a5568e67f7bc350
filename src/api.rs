//! Public library surface (spec §6): `QueryRequest`/`QueryResponse` wire
//! shapes and the `run_query` entry point an (out-of-scope) axum handler
//! would call and forward over SSE using [`crate::progress::StreamLine`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pipeline::StageContext;
use crate::progress::ProgressBus;
use crate::scheduler::{run_scheduler, QueryPlan};
use crate::types::ExpertAnswer;

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub expert_filter: Option<Vec<String>>,
    #[serde(default)]
    pub max_posts: Option<usize>,
    #[serde(default)]
    pub use_recent_only: bool,
    #[serde(default = "default_true")]
    pub include_comment_groups: bool,
    #[serde(default = "default_true")]
    pub stream_progress: bool,
    #[serde(default = "default_true")]
    pub use_personal_style: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub expert_responses: Vec<ExpertAnswer>,
    pub total_processing_time_ms: u64,
    pub request_id: String,
}

/// Malformed-request validation (spec §7: "the top-level call fails only
/// on malformed request, unknown Store, or request-level cancellation").
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("store error: {0}")]
    Store(#[from] crate::error::StorageError),
}

/// Run one query across every resolved expert and assemble the aggregate
/// response. `bus` is the caller's own [`ProgressBus`] (spec §9, "Progress
/// Bus as a capability, not a global") — a streaming caller subscribes to
/// it before calling `run_query` and drains it with
/// [`ProgressBus::drain_with_keepalives`] concurrently with this future.
pub async fn run_query(
    ctx: &StageContext,
    bus: &ProgressBus,
    cancellation: &CancellationToken,
    request: QueryRequest,
) -> Result<QueryResponse, QueryError> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(QueryError::EmptyQuery);
    }

    let started = std::time::Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let plan = QueryPlan {
        query: query.to_string(),
        expert_filter: request.expert_filter,
        max_posts: request.max_posts,
        use_recent_only: request.use_recent_only,
        include_comment_groups: request.include_comment_groups,
        use_personal_style: request.use_personal_style,
    };

    let expert_responses = run_scheduler(ctx, bus, cancellation, plan, Utc::now()).await;

    Ok(QueryResponse {
        query: query.to_string(),
        expert_responses,
        total_processing_time_ms: started.elapsed().as_millis() as u64,
        request_id,
    })
}
