//! Score MEDIUM posts and keep those crossing threshold, top-K (spec
//! §4.5). Same chunked listwise-LLM idiom as Map, reduced to a scalar
//! score per post instead of a tier.

use std::cmp::Ordering;

use serde::Deserialize;

use super::{truncate_snippet, StageContext};
use crate::config::ModelTag;
use crate::types::{Post, ScoredPost};

const SNIPPET_CHAR_BUDGET: usize = 1200;
const SCORING_OUTPUT_TOKENS: u32 = 2048;

/// Score MEDIUM-verdict posts and keep up to `top_k` with `score >=
/// threshold`. Caps the candidate set at `max_candidates` most-recent
/// posts before scoring (spec: "capped at 50; if more, keep the 50 most
/// recent"). On LLM failure, degrades to an empty list — the HIGH path
/// alone may still produce an answer.
pub async fn run_medium_rescue(
    ctx: &StageContext,
    expert_id: &str,
    question: &str,
    medium_posts: &[Post],
) -> Vec<ScoredPost> {
    if medium_posts.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<&Post> = medium_posts.iter().collect();
    candidates.sort_by(|a, b| b.authored_at.cmp(&a.authored_at));
    candidates.truncate(ctx.config.medium_rescue.max_candidates);

    let scored = match score_posts(ctx, expert_id, question, &candidates).await {
        Ok(scored) => scored,
        Err(err) => {
            tracing::warn!(expert_id, error = %err, "Medium-Rescue: scoring failed, degrading to empty list");
            return Vec::new();
        }
    };

    select_top_k(
        scored,
        ctx.config.medium_rescue.threshold,
        ctx.config.medium_rescue.top_k,
        &candidates,
    )
}

async fn score_posts(
    ctx: &StageContext,
    expert_id: &str,
    question: &str,
    candidates: &[&Post],
) -> Result<Vec<RawScore>, crate::error::GatewayError> {
    let numbered = candidates
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!(
                "[{i}] post_id={} date={}\n{}",
                p.id,
                p.authored_at.date_naive(),
                truncate_snippet(&p.body_markdown, SNIPPET_CHAR_BUDGET)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let system = "You score borderline-relevant posts for how useful each would be in \
         answering a question, on a scale from 0.0 (useless) to 1.0 (essential).";
    let user = format!(
        "Question: {question}\n\nCandidate posts:\n{numbered}\n\n\
         Score every post above. Respond with a JSON array, one entry per post, each \
         {{\"post_id\": <id>, \"score\": <float 0.0-1.0>, \"reason\": <string>}}."
    );
    let schema_hint = r#"[{"post_id": <int>, "score": <float>, "reason": "<string>"}]"#;

    let raw = crate::llm::retry::with_stage_retry(&ctx.config.retry, || {
        let ctx = ctx.clone();
        let system = system.to_string();
        let user = user.clone();
        async move {
            ctx.gateway
                .complete_json(
                    ModelTag::MediumScoring,
                    &system,
                    &user,
                    schema_hint,
                    SCORING_OUTPUT_TOKENS,
                )
                .await
        }
    })
    .await?;

    serde_json::from_value::<Vec<RawScore>>(raw).map_err(|e| {
        tracing::warn!(expert_id, error = %e, "Medium-Rescue: response did not match score schema");
        crate::error::GatewayError::Parse(e.to_string())
    })
}

#[derive(Debug, Deserialize)]
struct RawScore {
    post_id: i64,
    score: f32,
    #[serde(default)]
    reason: String,
}

/// Keep candidates with `score >= threshold`, then take the top `top_k`.
/// Stable tie-break: higher score first, then newer post first (spec
/// §4.5). Posts the model didn't score are excluded, not defaulted.
fn select_top_k(
    raw_scores: Vec<RawScore>,
    threshold: f32,
    top_k: usize,
    candidates: &[&Post],
) -> Vec<ScoredPost> {
    let authored_at = |id: i64| {
        candidates
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.authored_at)
    };

    let mut scored: Vec<ScoredPost> = raw_scores
        .into_iter()
        .filter(|s| s.score >= threshold)
        .map(|s| ScoredPost {
            post_id: s.post_id,
            score: s.score,
            reason: s.reason,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let a_date = authored_at(a.post_id);
                let b_date = authored_at(b.post_id);
                b_date.cmp(&a_date)
            })
    });
    scored.truncate(top_k);
    scored
}
