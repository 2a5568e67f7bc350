//! Synthesize the final answer from selected posts with strict citation
//! format, fact-validated (spec §4.7). Context construction, citation
//! extraction/validation, sanitization, and the confidence rule are each
//! mandatory parts of this stage's contract, not independent concerns.

use std::collections::HashSet;

use serde::Deserialize;

use super::StageContext;
use crate::citation;
use crate::config::ModelTag;
use crate::error::GatewayError;
use crate::types::{Confidence, Post, ReduceStyle, SelectedSource, SourceTier};

const REDUCE_OUTPUT_TOKENS: u32 = 4096;

pub struct ReduceOutput {
    pub answer_markdown: String,
    pub main_sources: Vec<i64>,
    pub confidence: Confidence,
    /// The post ids actually shown to the model — Comment-Group excludes
    /// these too, but per spec §4.9 it only excludes `main_sources`, so
    /// this is exposed for diagnostics/tests, not as the exclusion set.
    pub context_post_ids: HashSet<i64>,
}

/// Build the capped, tier-and-recency-ordered context from `sources`, call
/// the model to synthesize an answer, then fact-validate its citations
/// against that exact context set.
pub async fn run_reduce(
    ctx: &StageContext,
    expert_id: &str,
    question: &str,
    sources: Vec<SelectedSource>,
    style: ReduceStyle,
) -> Result<ReduceOutput, GatewayError> {
    let context = build_context(sources, ctx.config.reduce.max_context_posts);
    let context_post_ids: HashSet<i64> = context.iter().map(|s| s.post_id).collect();
    let has_high_in_context = context.iter().any(|s| s.tier == SourceTier::High);

    let rendered = context
        .iter()
        .map(render_source)
        .collect::<Vec<_>>()
        .join("\n\n");

    let system = system_prompt(style);
    let user = format!(
        "Question: {question}\n\nSource posts:\n{rendered}\n\n\
         Write an answer grounded only in the posts above. Cite every claim with \
         `[post:ID]` using the post_id values shown. Respond with JSON: \
         {{\"answer_markdown\": <string>, \"confidence\": \"HIGH\"|\"MEDIUM\"|\"LOW\"}}."
    );
    let schema_hint = r#"{"answer_markdown": "<markdown with [post:ID] citations>", "confidence": "HIGH"|"MEDIUM"|"LOW"}"#;

    let raw = crate::llm::retry::with_stage_retry(&ctx.config.retry, || {
        let ctx = ctx.clone();
        let system = system.clone();
        let user = user.clone();
        async move {
            ctx.gateway
                .complete_json(ModelTag::Synthesis, &system, &user, schema_hint, REDUCE_OUTPUT_TOKENS)
                .await
        }
    })
    .await?;

    let parsed: RawReduceResponse =
        serde_json::from_value(raw).map_err(|e| GatewayError::Parse(e.to_string()))?;

    let sanitized = citation::sanitize_for_json(&parsed.answer_markdown);
    let validation = citation::validate_citations(&sanitized, &context_post_ids);

    let confidence = resolve_confidence(
        &validation.main_sources,
        has_high_in_context,
        parsed.confidence,
        expert_id,
    );

    Ok(ReduceOutput {
        answer_markdown: validation.sanitized_markdown,
        main_sources: validation.main_sources,
        confidence,
        context_post_ids,
    })
}

/// Cap at `max_posts`, stable-sorted by tier priority (HIGH > MEDIUM* >
/// LINKED_CONTEXT) then recency within a tier (spec §4.7 step 1).
fn build_context(mut sources: Vec<SelectedSource>, max_posts: usize) -> Vec<SelectedSource> {
    sources.sort_by(|a, b| {
        tier_rank(a.tier)
            .cmp(&tier_rank(b.tier))
            .then_with(|| b.post.authored_at.cmp(&a.post.authored_at))
    });
    // A post can be selected under more than one tier (e.g. a 1-hop linked
    // neighbor of a HIGH post that also cleared Medium-Rescue's threshold);
    // the sort above puts its strongest-tier occurrence first, so keep the
    // first and drop the rest to preserve set-union semantics over the
    // distinct-post context cap.
    let mut seen = HashSet::new();
    sources.retain(|s| seen.insert(s.post_id));
    sources.truncate(max_posts);
    sources
}

fn tier_rank(tier: SourceTier) -> u8 {
    match tier {
        SourceTier::High => 0,
        SourceTier::MediumStar => 1,
        SourceTier::LinkedContext => 2,
    }
}

fn render_source(source: &SelectedSource) -> String {
    let post: &Post = &source.post;
    format!(
        "[post:{}]\nDate: {}\nAuthor: {}\n\n{}",
        post.id,
        post.authored_at.date_naive(),
        post.author_display,
        post.body_markdown
    )
}

fn system_prompt(style: ReduceStyle) -> String {
    match style {
        ReduceStyle::Personal => {
            "You are writing as the author of these posts, in first person, synthesizing \
             your own past writing into a direct answer to the question. Stay grounded \
             strictly in the source posts provided; do not invent claims they don't support."
                .to_string()
        }
        ReduceStyle::Neutral => {
            "You are a third-person analyst summarizing what an author's posts say about \
             the question. Stay grounded strictly in the source posts provided; do not \
             invent claims they don't support."
                .to_string()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawReduceResponse {
    answer_markdown: String,
    #[serde(default)]
    confidence: Option<Confidence>,
}

/// The post-hoc rule (spec §4.7) always wins over the model's own label;
/// the model's label is logged as a diagnostic when it disagrees (spec §9
/// Open Question decision).
fn resolve_confidence(
    main_sources: &[i64],
    has_high_in_context: bool,
    model_confidence: Option<Confidence>,
    expert_id: &str,
) -> Confidence {
    let rule_confidence = if main_sources.is_empty() {
        Confidence::Low
    } else if main_sources.len() >= 3 && has_high_in_context {
        Confidence::High
    } else {
        Confidence::Medium
    };

    if let Some(model_confidence) = model_confidence {
        if model_confidence != rule_confidence {
            tracing::debug!(
                expert_id,
                model = ?model_confidence,
                rule = ?rule_confidence,
                "Reduce: model confidence label disagreed with post-hoc rule, rule wins"
            );
        }
    }

    rule_confidence
}
