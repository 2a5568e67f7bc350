//! Chunked listwise LLM ranking (spec §4.4). No vector index: relevance
//! comes from asking the model to classify a numbered batch of posts at a
//! time. Grounded on `reranking::llm_reranker`'s single-call ranking-prompt
//! shape, generalized from "produce an ordering" to "produce a HIGH/MEDIUM/
//! LOW verdict per post", plus the bounded-fan-out + partial-failure
//! tolerance pattern from `ConaryLabs-Mira::experts::council::execute_phase`.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::sync::Semaphore;

use super::{truncate_snippet, StageContext};
use crate::config::ModelTag;
use crate::types::{Post, RelevanceLevel, RelevanceVerdict};

const SNIPPET_CHAR_BUDGET: usize = 1200;
const MAP_OUTPUT_TOKENS: u32 = 4096;

/// Per-chunk retry state, the tagged variant spec §9's design notes ask
/// for an implementer to represent as a closed enum.
#[derive(Debug, Clone)]
enum ChunkState {
    Succeeded(Vec<RelevanceVerdict>),
    Failed(String),
}

struct Chunk<'a> {
    index: usize,
    posts: &'a [Post],
}

/// Classify every post in `posts` as HIGH/MEDIUM/LOW relevance to
/// `question`. Returns a verdict for every post the pipeline could
/// classify; posts in chunks that fail every retry layer are simply
/// absent — Map failure is a recoverable per-chunk event, not a whole-
/// stage failure (spec §4.4).
pub async fn run_map(
    ctx: &StageContext,
    expert_id: &str,
    question: &str,
    posts: &[Post],
) -> Vec<RelevanceVerdict> {
    if posts.is_empty() {
        return Vec::new();
    }

    let chunk_size = ctx.config.map.chunk_size.max(1);
    let chunks: Vec<Chunk<'_>> = posts
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, posts)| Chunk { index, posts })
        .collect();

    // run_chunks yields completions in finish-order, not submission-order;
    // re-sort by chunk index so `states` is chunk-indexed before anything
    // below treats it as such (same pattern as `scheduler.rs`'s fan-out).
    let mut states = into_indexed(run_chunks(ctx, expert_id, question, &chunks).await);

    // Pipeline-layer retry (Map only, spec §4.1 layer 3): after every chunk
    // task completes, re-queue any still-failed chunk once, after a fixed
    // cooldown sized to cross a one-minute provider rate window.
    let failed_indices: Vec<usize> = states
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, ChunkState::Failed(_)))
        .map(|(i, _)| i)
        .collect();

    if !failed_indices.is_empty() {
        tracing::warn!(
            expert_id,
            failed_chunks = failed_indices.len(),
            cooldown_secs = ctx.config.retry.pipeline_cooldown_secs,
            "Map: some chunks failed, cooling down before pipeline-layer retry"
        );
        tokio::time::sleep(Duration::from_secs(ctx.config.retry.pipeline_cooldown_secs)).await;

        let retry_chunks: Vec<Chunk<'_>> = failed_indices
            .iter()
            .map(|&i| Chunk {
                index: chunks[i].index,
                posts: chunks[i].posts,
            })
            .collect();
        let retried = into_indexed(run_chunks(ctx, expert_id, question, &retry_chunks).await);
        for (original_index, state) in retried {
            states[original_index] = state;
        }
    }

    let mut verdicts = Vec::with_capacity(posts.len());
    for (chunk, state) in chunks.iter().zip(states.into_iter()) {
        match state {
            ChunkState::Succeeded(v) => verdicts.extend(v),
            ChunkState::Failed(reason) => {
                tracing::warn!(
                    expert_id,
                    chunk = chunk.index,
                    reason,
                    "Map: chunk failed across all retry layers, excluding its posts"
                );
            }
        }
    }
    verdicts
}

/// Re-sort `(chunk index, state)` pairs back into chunk order and drop the
/// index, so the caller can index into the result like a plain chunk vec.
fn into_indexed(mut results: Vec<(usize, ChunkState)>) -> Vec<ChunkState> {
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, state)| state).collect()
}

async fn run_chunks(
    ctx: &StageContext,
    expert_id: &str,
    question: &str,
    chunks: &[Chunk<'_>],
) -> Vec<(usize, ChunkState)> {
    let semaphore = std::sync::Arc::new(Semaphore::new(ctx.config.map.concurrency.max(1)));

    let tasks = chunks.iter().map(|chunk| {
        let semaphore = semaphore.clone();
        let ctx = ctx.clone();
        let question = question.to_string();
        let posts = chunk.posts;
        let index = chunk.index;
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            let state = classify_chunk(&ctx, expert_id, index, &question, posts).await;
            (index, state)
        }
    });

    stream::iter(tasks)
        .buffer_unordered(ctx.config.map.concurrency.max(1))
        .collect()
        .await
}

async fn classify_chunk(
    ctx: &StageContext,
    expert_id: &str,
    chunk_index: usize,
    question: &str,
    posts: &[Post],
) -> ChunkState {
    let numbered = posts
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!(
                "[{i}] post_id={} author={} date={}\n{}",
                p.id,
                p.author_display,
                p.authored_at.date_naive(),
                truncate_snippet(&p.body_markdown, SNIPPET_CHAR_BUDGET)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let system = "You are a relevance classifier for a question-answering system over a \
         curated post corpus. For every post shown, decide whether it is HIGH, MEDIUM, or \
         LOW relevance to the question, and give a one-sentence reason.";
    let user = format!(
        "Question: {question}\n\nPosts (reverse-chronological):\n{numbered}\n\n\
         Classify every post above. Respond with a JSON array, one entry per post, each \
         {{\"post_id\": <id>, \"level\": \"HIGH\"|\"MEDIUM\"|\"LOW\", \"reason\": <string>}}."
    );
    let schema_hint = r#"[{"post_id": <int>, "level": "HIGH"|"MEDIUM"|"LOW", "reason": "<string>"}]"#;

    let attempt_result = crate::llm::retry::with_stage_retry(&ctx.config.retry, || {
        let ctx = ctx.clone();
        let system = system.to_string();
        let user = user.clone();
        async move {
            ctx.gateway
                .complete_json(ModelTag::Map, &system, &user, schema_hint, MAP_OUTPUT_TOKENS)
                .await
        }
    })
    .await;

    let raw = match attempt_result {
        Ok(value) => value,
        Err(err) => {
            return ChunkState::Failed(format!(
                "expert={expert_id} chunk={chunk_index}: {err}"
            ));
        }
    };

    match serde_json::from_value::<Vec<RawVerdict>>(raw) {
        Ok(raw_verdicts) => ChunkState::Succeeded(reconcile(posts, raw_verdicts)),
        Err(err) => ChunkState::Failed(format!(
            "expert={expert_id} chunk={chunk_index}: response did not match verdict schema: {err}"
        )),
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    post_id: i64,
    level: RelevanceLevel,
    #[serde(default)]
    reason: String,
}

/// Reconcile the model's verdicts against the posts actually in the chunk:
/// missing posts default to LOW "unclassified" (spec §4.4 edge case);
/// verdicts for ids outside the chunk are dropped.
fn reconcile(posts: &[Post], raw_verdicts: Vec<RawVerdict>) -> Vec<RelevanceVerdict> {
    let mut by_id: HashMap<i64, RawVerdict> =
        raw_verdicts.into_iter().map(|v| (v.post_id, v)).collect();

    posts
        .iter()
        .map(|post| match by_id.remove(&post.id) {
            Some(v) => RelevanceVerdict {
                post_id: post.id,
                level: v.level,
                reason: v.reason,
            },
            None => RelevanceVerdict {
                post_id: post.id,
                level: RelevanceLevel::Low,
                reason: "unclassified".to_string(),
            },
        })
        .collect()
}
