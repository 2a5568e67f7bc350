//! Free-form Markdown summary of the comment groups Comment-Group
//! surfaced (spec §4.10). Runs only when at least one group is non-empty;
//! its hard contract is never emitting a `[post:` citation token — comment
//! groups are supplementary color, not fact-checked sources (spec §8
//! property 7).

use super::StageContext;
use crate::config::ModelTag;
use crate::types::CommentGroupResult;

const SYNTHESIS_OUTPUT_TOKENS: u32 = 2048;

/// Synthesize a Markdown summary across up to four sections: author
/// clarifications and community notes on main sources, then the author's
/// and community's additional commentary surfaced from drift groups.
/// Returns `None` if there is nothing to synthesize, or if the stage
/// fails after retries — comment synthesis is never allowed to block the
/// main answer.
pub async fn run_comment_synthesis(
    ctx: &StageContext,
    expert_id: &str,
    groups: &[CommentGroupResult],
) -> Option<String> {
    if groups.is_empty() {
        return None;
    }

    let rendered = render_groups(groups);
    let system = "Summarize the following comment discussions into a short Markdown \
         briefing with up to four sections: author clarifications on main sources, \
         community notes on main sources, the author's own comments in drifted \
         discussions, and community opinions from drifted discussions. Omit any section \
         with nothing to say. Never write a `[post:` citation token anywhere in your \
         output — these are supplementary notes, not cited sources.";
    let user = format!("Comment groups:\n{rendered}");

    let result = crate::llm::retry::with_stage_retry(&ctx.config.retry, || {
        let ctx = ctx.clone();
        let user = user.clone();
        async move {
            ctx.gateway
                .complete_text(ModelTag::CommentGroups, system, &user, SYNTHESIS_OUTPUT_TOKENS)
                .await
        }
    })
    .await;

    match result {
        Ok(text) => Some(strip_citation_tokens(&text)),
        Err(err) => {
            tracing::warn!(expert_id, error = %err, "Comment-Synthesis: stage failed, omitting summary");
            None
        }
    }
}

fn render_groups(groups: &[CommentGroupResult]) -> String {
    groups
        .iter()
        .map(|g| {
            let comments = g
                .comments
                .iter()
                .map(|c| format!("  - {}: {}", c.author_display, c.body_markdown))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "Anchor: {}\nRelevance: {:?}\nReason: {}\n{comments}",
                g.anchor_snapshot, g.relevance, g.reason
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Defense in depth against the model emitting a citation anyway: drop any
/// `[post:` occurrence outright rather than trying to repair it into valid
/// Markdown, since comment synthesis text carries no validated context set
/// to check a citation against.
fn strip_citation_tokens(text: &str) -> String {
    if !text.contains("[post:") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[post:") {
        out.push_str(&rest[..start]);
        match rest[start..].find(']') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
