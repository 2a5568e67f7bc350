//! Select relevant comment discussions using three sources in priority
//! order (spec §4.9): author clarifications and community comments on
//! main-source posts bypass the LLM entirely; drift groups on posts
//! outside `main_sources` are scored via chunked listwise LLM relevance,
//! reusing Map's idiom against drift topics instead of whole post bodies.

use std::collections::{HashMap, HashSet};

use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use super::StageContext;
use crate::config::ModelTag;
use crate::error::StorageError;
use crate::store;
use crate::types::{CommentGroupResult, CommentSnapshot, DriftAnchor, RelevanceLevel};

const DRIFT_SCORING_OUTPUT_TOKENS: u32 = 2048;

pub async fn run_comment_group(
    ctx: &StageContext,
    expert_id: &str,
    channel_handle: &str,
    question: &str,
    main_sources: &[i64],
    cutoff: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<Vec<CommentGroupResult>, StorageError> {
    let mut groups = from_main_sources(ctx, expert_id, channel_handle, main_sources).await?;

    let exclude: Vec<i64> = main_sources.to_vec();
    let drift_anchors =
        store::drift::load_drift_groups(&ctx.pool, expert_id, &exclude, cutoff).await?;

    let drift_groups =
        score_drift_groups(ctx, expert_id, channel_handle, question, drift_anchors).await;
    groups.extend(drift_groups);

    Ok(groups)
}

/// Sources 1 and 2: author clarifications and community comments on
/// `main_sources` posts, both bypassing the LLM with `relevance = HIGH`
/// (spec §4.9 priority 1 and 2).
async fn from_main_sources(
    ctx: &StageContext,
    expert_id: &str,
    channel_handle: &str,
    main_sources: &[i64],
) -> Result<Vec<CommentGroupResult>, StorageError> {
    if main_sources.is_empty() {
        return Ok(Vec::new());
    }

    let posts = store::posts::fetch_posts_by_ids(&ctx.pool, expert_id, main_sources, None).await?;
    let mut groups = Vec::new();

    for &post_id in main_sources {
        let Some(post) = posts.get(&post_id) else {
            continue;
        };
        let comments = store::comments::load_comments_for_anchor(&ctx.pool, post_id).await?;
        if comments.is_empty() {
            continue;
        }

        let (author_comments, community_comments): (Vec<_>, Vec<_>) = comments
            .into_iter()
            .partition(|c| c.author_display == post.author_display);

        if !author_comments.is_empty() {
            groups.push(CommentGroupResult {
                anchor_post_id: post_id,
                anchor_snapshot: render_anchor_snapshot(channel_handle, post),
                telegram_link: telegram_link(channel_handle, post.telegram_message_id),
                comment_count: author_comments.len(),
                relevance: RelevanceLevel::High,
                reason: "author clarification on a main-source post".to_string(),
                comments: author_comments.iter().map(CommentSnapshot::from).collect(),
            });
        }
        if !community_comments.is_empty() {
            groups.push(CommentGroupResult {
                anchor_post_id: post_id,
                anchor_snapshot: render_anchor_snapshot(channel_handle, post),
                telegram_link: telegram_link(channel_handle, post.telegram_message_id),
                comment_count: community_comments.len(),
                relevance: RelevanceLevel::High,
                reason: "community discussion on a main-source post".to_string(),
                comments: community_comments.iter().map(CommentSnapshot::from).collect(),
            });
        }
    }

    Ok(groups)
}

/// Source 3: drift groups on posts outside `main_sources`, chunked and
/// scored for relevance to the question via the LLM. Only HIGH-verdict
/// groups survive.
async fn score_drift_groups(
    ctx: &StageContext,
    expert_id: &str,
    channel_handle: &str,
    question: &str,
    anchors: Vec<DriftAnchor>,
) -> Vec<CommentGroupResult> {
    if anchors.is_empty() {
        return Vec::new();
    }

    let chunk_size = ctx.config.comment_group.drift_chunk_size.max(1);
    let concurrency = ctx.config.comment_group.drift_concurrency.max(1);
    let semaphore = std::sync::Arc::new(Semaphore::new(concurrency));

    let mut by_id: HashMap<i64, DriftAnchor> =
        anchors.iter().cloned().map(|a| (a.post.id, a)).collect();

    let chunks: Vec<Vec<DriftAnchor>> = anchors.chunks(chunk_size).map(|c| c.to_vec()).collect();

    let tasks = chunks.into_iter().map(|chunk| {
        let semaphore = semaphore.clone();
        let ctx = ctx.clone();
        let question = question.to_string();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            classify_drift_chunk(&ctx, expert_id, &question, chunk).await
        }
    });

    let verdicts: Vec<HashSet<i64>> = stream::iter(tasks)
        .buffer_unordered(concurrency)
        .collect()
        .await;
    let relevant_ids: HashSet<i64> = verdicts.into_iter().flatten().collect();

    let mut groups = Vec::new();
    for post_id in relevant_ids {
        let Some(anchor) = by_id.remove(&post_id) else {
            continue;
        };
        let comments = match store::comments::load_comments_for_anchor(&ctx.pool, post_id).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(expert_id, post_id, error = %err, "Comment-Group: failed to load drift group comments");
                continue;
            }
        };
        if comments.is_empty() {
            continue;
        }
        groups.push(CommentGroupResult {
            anchor_post_id: post_id,
            anchor_snapshot: render_anchor_snapshot(channel_handle, &anchor.post),
            telegram_link: telegram_link(channel_handle, anchor.post.telegram_message_id),
            comment_count: comments.len(),
            relevance: RelevanceLevel::High,
            reason: "drifted comment thread relevant to the question".to_string(),
            comments: comments.iter().map(CommentSnapshot::from).collect(),
        });
    }
    groups
}

async fn classify_drift_chunk(
    ctx: &StageContext,
    expert_id: &str,
    question: &str,
    chunk: Vec<DriftAnchor>,
) -> HashSet<i64> {
    let numbered = chunk
        .iter()
        .map(|a| {
            let topics = a
                .drift_topics
                .iter()
                .map(|t| format!("- {} (keywords: {})", t.topic, t.keywords.join(", ")))
                .collect::<Vec<_>>()
                .join("\n");
            format!("post_id={}\n{}", a.post.id, topics)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let system = "You decide whether a drifted comment discussion is relevant to a \
         question, based only on its topic list.";
    let user = format!(
        "Question: {question}\n\nDrifted discussions:\n{numbered}\n\n\
         Respond with a JSON array of the post_id values whose discussion is relevant to \
         the question. Omit irrelevant ones entirely."
    );
    let schema_hint = "[<int post_id>, ...]";

    let result = crate::llm::retry::with_stage_retry(&ctx.config.retry, || {
        let ctx = ctx.clone();
        let system = system.to_string();
        let user = user.clone();
        async move {
            ctx.gateway
                .complete_json(
                    ModelTag::CommentGroups,
                    &system,
                    &user,
                    schema_hint,
                    DRIFT_SCORING_OUTPUT_TOKENS,
                )
                .await
        }
    })
    .await;

    match result.and_then(|v| {
        serde_json::from_value::<Vec<i64>>(v).map_err(|e| crate::error::GatewayError::Parse(e.to_string()))
    }) {
        Ok(ids) => ids.into_iter().collect(),
        Err(err) => {
            tracing::warn!(expert_id, error = %err, "Comment-Group: drift chunk scoring failed, excluding its posts");
            HashSet::new()
        }
    }
}

fn render_anchor_snapshot(channel_handle: &str, post: &crate::types::Post) -> String {
    let preview: String = post.body_markdown.chars().take(200).collect();
    format!(
        "@{channel_handle} · {} · {}\n{preview}",
        post.author_display,
        post.authored_at.date_naive()
    )
}

fn telegram_link(channel_handle: &str, telegram_message_id: i64) -> String {
    format!("https://t.me/{channel_handle}/{telegram_message_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Post;
    use chrono::Utc;

    fn post(id: i64, author: &str) -> Post {
        Post {
            id,
            expert_id: "e1".into(),
            channel_id: "c".into(),
            telegram_message_id: id + 1000,
            authored_at: Utc::now(),
            author_display: author.into(),
            body_markdown: "x".repeat(300),
            forwarded_from: None,
        }
    }

    #[test]
    fn snapshot_preview_is_capped_at_200_chars() {
        let snapshot = render_anchor_snapshot("chan", &post(1, "Author"));
        let preview_len = snapshot.lines().last().unwrap().chars().count();
        assert_eq!(preview_len, 200);
    }

    #[test]
    fn telegram_link_uses_channel_and_message_id() {
        assert_eq!(telegram_link("mychan", 42), "https://t.me/mychan/42");
    }
}
