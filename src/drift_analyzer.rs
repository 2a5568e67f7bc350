//! Offline Drift Pre-Analyzer (spec §4.13). Runs outside the query path:
//! for each post with a comment thread and no completed drift record,
//! asks the model whether the thread drifted and, if so, for structured
//! drift topics. Grounded on Map's chunked-LLM-call idiom, swapping "parse
//! a relevance verdict" for "parse a drift decision", writing through
//! `store::drift` instead of returning a transient verdict.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::{AppConfig, ModelTag};
use crate::error::StorageError;
use crate::llm::LlmGateway;
use crate::store::{self, DbPool};
use crate::types::{Comment, DriftTopic};

const ANALYZER_IDENTITY: &str = "drift-analyzer-v1";
const DRIFT_OUTPUT_TOKENS: u32 = 1024;

pub struct AnalyzerContext {
    pub gateway: Arc<dyn LlmGateway>,
    pub pool: DbPool,
    pub config: AppConfig,
}

/// Analyze every post of `expert_id` queued for (re-)analysis. Per-post
/// failures are logged and skipped — one bad prompt never blocks the rest
/// of the queue, the same partial-failure tolerance the query-path stages
/// give Map chunks.
pub async fn run_drift_analysis(ctx: &AnalyzerContext, expert_id: &str) -> Result<usize, StorageError> {
    let queue = store::drift::posts_needing_drift_analysis(&ctx.pool, expert_id).await?;
    let mut analyzed = 0usize;

    for post_id in queue {
        match analyze_post(ctx, expert_id, post_id).await {
            Ok(()) => analyzed += 1,
            Err(err) => {
                tracing::warn!(expert_id, post_id, error = %err, "Drift-Analyzer: skipping post after failure");
            }
        }
    }

    Ok(analyzed)
}

async fn analyze_post(ctx: &AnalyzerContext, expert_id: &str, post_id: i64) -> Result<(), String> {
    let post = store::posts::fetch_posts_by_ids(&ctx.pool, expert_id, &[post_id], None)
        .await
        .map_err(|e| e.to_string())?
        .remove(&post_id)
        .ok_or_else(|| "post disappeared from store".to_string())?;
    let comments = store::comments::load_comments_for_anchor(&ctx.pool, post_id)
        .await
        .map_err(|e| e.to_string())?;

    let decision = request_drift_decision(ctx, &post.body_markdown, &comments)
        .await
        .map_err(|e| e.to_string())?;

    store::drift::upsert_drift_record(
        &ctx.pool,
        post_id,
        expert_id,
        decision.has_drift,
        &decision.drift_topics,
        ANALYZER_IDENTITY,
    )
    .await
    .map_err(|e| e.to_string())
}

#[derive(Debug, Deserialize)]
struct DriftDecision {
    has_drift: bool,
    #[serde(default)]
    drift_topics: Vec<DriftTopic>,
}

/// Quality rules are enforced entirely by the prompt (spec §4.13): a drift
/// topic's keywords must name concrete products or tools, never a
/// methodology or category, and a topic the anchor post already mentions
/// must be rejected outright.
async fn request_drift_decision(
    ctx: &AnalyzerContext,
    anchor_body: &str,
    comments: &[Comment],
) -> Result<DriftDecision, crate::error::GatewayError> {
    let rendered_comments = comments
        .iter()
        .map(|c| format!("- {}: {}", c.author_display, c.body_markdown))
        .collect::<Vec<_>>()
        .join("\n");

    let system = "You decide whether a comment thread drifted away from its anchor post's \
         topic onto something else worth surfacing later. A drift topic's keywords must be \
         concrete product or tool names, never a methodology, category, or generic concept. \
         Reject any topic the anchor post already mentions explicitly.";
    let user = format!(
        "Anchor post:\n{anchor_body}\n\nComments:\n{rendered_comments}\n\n\
         Respond with JSON: {{\"has_drift\": bool, \"drift_topics\": \
         [{{\"topic\": string, \"keywords\": [string], \"key_phrases\": [string], \
         \"context\": string}}]}}. If there is no drift, return an empty \
         drift_topics array."
    );
    let schema_hint = r#"{"has_drift": bool, "drift_topics": [{"topic": "...", "keywords": ["..."], "key_phrases": ["..."], "context": "..."}]}"#;

    let raw = crate::llm::retry::with_stage_retry(&ctx.config.retry, || {
        let gateway = ctx.gateway.clone();
        let system = system.to_string();
        let user = user.clone();
        async move {
            gateway
                .complete_json(ModelTag::Drift, &system, &user, schema_hint, DRIFT_OUTPUT_TOKENS)
                .await
        }
    })
    .await?;

    serde_json::from_value(raw).map_err(|e| crate::error::GatewayError::Parse(e.to_string()))
}
