//! Per-expert stage sequencing (spec §4.11): Map -> Medium-Rescue ->
//! Resolve -> Reduce -> Language-Check, with Comment-Group/Comment-
//! Synthesis running alongside Language-Check. Grounded on
//! `ConaryLabs-Mira::experts::council::run_council`'s phase sequencing —
//! broadcast at phase boundaries, a per-task wall-clock ceiling, cooperative
//! cancellation via a shared token rather than per-call plumbing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{comment_group, comment_synthesis, language_check, map, medium_rescue, reduce, resolve, StageContext};
use crate::progress::{EventStatus, Phase, ProgressBus, ProgressEvent};
use crate::store;
use crate::types::{
    CommentGroupResult, Confidence, Expert, ExpertAnswer, Post, RelevanceLevel, ReduceStyle,
    ScoredPost, SelectedSource, SourceTier,
};

pub struct OrchestratorRequest<'a> {
    pub expert: &'a Expert,
    pub question: &'a str,
    pub max_posts: Option<usize>,
    pub cutoff: Option<DateTime<Utc>>,
    pub style: ReduceStyle,
    pub include_comment_groups: bool,
}

/// Run the full per-expert pipeline, honoring the per-expert wall-clock
/// ceiling (`config.expert_ceiling_secs`) and a shared cancellation token.
/// On either firing, returns whatever partial state has been computed so
/// far rather than an error — a cancelled or timed-out expert still
/// contributes a (possibly apologetic) Expert Answer to the response.
pub async fn run_orchestrator(
    ctx: &StageContext,
    bus: &ProgressBus,
    cancellation: &CancellationToken,
    request: OrchestratorRequest<'_>,
) -> ExpertAnswer {
    let started = Instant::now();
    let deadline = started + Duration::from_secs(ctx.config.expert_ceiling_secs);
    let expert = request.expert;

    macro_rules! unwind_if_done {
        ($posts_analyzed:expr) => {
            if cancellation.is_cancelled() {
                tracing::warn!(expert_id = %expert.id, "Orchestrator: cancellation observed, unwinding");
                return apology_answer(expert, "This request was cancelled.", $posts_analyzed, started);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    expert_id = %expert.id,
                    ceiling_secs = ctx.config.expert_ceiling_secs,
                    "Orchestrator: hit per-expert ceiling, returning partial state"
                );
                return apology_answer(
                    expert,
                    "This expert's analysis did not finish in time.",
                    $posts_analyzed,
                    started,
                );
            }
        };
    }

    bus.emit(
        ProgressEvent::new(Phase::Map, EventStatus::Started, "map: loading posts")
            .for_expert(expert.id.clone()),
    );

    let mut posts = match store::posts::list_posts(&ctx.pool, &expert.id, request.cutoff).await {
        Ok(posts) => posts,
        Err(err) => {
            tracing::error!(expert_id = %expert.id, error = %err, "Orchestrator: Store failed, fatal for this expert");
            return apology_answer(expert, "An internal error prevented this expert from being analyzed.", 0, started);
        }
    };
    if let Some(max_posts) = request.max_posts {
        posts.truncate(max_posts);
    }

    let posts_by_id: HashMap<i64, Post> = posts.iter().cloned().map(|p| (p.id, p)).collect();

    let verdicts = map::run_map(ctx, &expert.id, request.question, &posts).await;
    let posts_analyzed = verdicts.len();
    bus.emit(
        ProgressEvent::new(
            Phase::Map,
            EventStatus::Completed,
            format!("map: classified {posts_analyzed} post(s)"),
        )
        .for_expert(expert.id.clone()),
    );

    unwind_if_done!(posts_analyzed);

    let high_ids: Vec<i64> = verdicts
        .iter()
        .filter(|v| v.level == RelevanceLevel::High)
        .map(|v| v.post_id)
        .collect();
    let medium_posts: Vec<Post> = verdicts
        .iter()
        .filter(|v| v.level == RelevanceLevel::Medium)
        .filter_map(|v| posts_by_id.get(&v.post_id).cloned())
        .collect();

    bus.emit(
        ProgressEvent::new(Phase::MediumScoring, EventStatus::Started, "medium-rescue: scoring")
            .for_expert(expert.id.clone()),
    );
    let medium_selected: Vec<ScoredPost> =
        medium_rescue::run_medium_rescue(ctx, &expert.id, request.question, &medium_posts).await;
    bus.emit(
        ProgressEvent::new(
            Phase::MediumScoring,
            EventStatus::Completed,
            format!("medium-rescue: kept {}", medium_selected.len()),
        )
        .for_expert(expert.id.clone()),
    );

    unwind_if_done!(posts_analyzed);

    // Zero-HIGH and zero-MEDIUM* is the boundary case spec §4.11 names
    // explicitly: skip Reduce/Language-Check/Comment-Synth, but
    // Comment-Group still runs if configured.
    if high_ids.is_empty() && medium_selected.is_empty() {
        let (comment_groups, _) = run_comment_pipeline(
            ctx,
            bus,
            expert,
            request.question,
            &[],
            request.cutoff,
            false,
            request.include_comment_groups,
        )
        .await;

        return ExpertAnswer {
            expert_id: expert.id.clone(),
            expert_name: expert.display_name.clone(),
            channel_handle: expert.channel_handle.clone(),
            answer_markdown: "I don't have enough relevant material in this expert's corpus \
                 to answer that question."
                .to_string(),
            main_sources: Vec::new(),
            confidence: Confidence::Low,
            posts_analyzed,
            processing_time_ms: started.elapsed().as_millis() as u64,
            comment_groups,
            comment_synthesis: None,
            translation_applied: false,
        };
    }

    bus.emit(
        ProgressEvent::new(Phase::Resolve, EventStatus::Started, "resolve: expanding links")
            .for_expert(expert.id.clone()),
    );
    let resolved_ids = match resolve::run_resolve(ctx, &expert.id, &high_ids, request.cutoff).await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::error!(expert_id = %expert.id, error = %err, "Orchestrator: Resolve store error, fatal for this expert");
            return apology_answer(expert, "An internal error prevented this expert from being analyzed.", posts_analyzed, started);
        }
    };
    bus.emit(
        ProgressEvent::new(
            Phase::Resolve,
            EventStatus::Completed,
            format!("resolve: {} post(s) in context", resolved_ids.len()),
        )
        .for_expert(expert.id.clone()),
    );

    unwind_if_done!(posts_analyzed);

    let high_id_set: std::collections::HashSet<i64> = high_ids.iter().copied().collect();
    let mut sources: Vec<SelectedSource> = Vec::new();
    for id in &resolved_ids {
        let Some(post) = posts_by_id.get(id) else { continue };
        let tier = if high_id_set.contains(id) {
            SourceTier::High
        } else {
            SourceTier::LinkedContext
        };
        sources.push(SelectedSource { post_id: *id, tier, post: post.clone() });
    }
    for scored in &medium_selected {
        let Some(post) = posts_by_id.get(&scored.post_id) else { continue };
        sources.push(SelectedSource {
            post_id: scored.post_id,
            tier: SourceTier::MediumStar,
            post: post.clone(),
        });
    }

    bus.emit(
        ProgressEvent::new(Phase::Reduce, EventStatus::Started, "reduce: synthesizing answer")
            .for_expert(expert.id.clone()),
    );
    let reduce_output = match reduce::run_reduce(ctx, &expert.id, request.question, sources, request.style).await {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(expert_id = %expert.id, error = %err, "Orchestrator: Reduce failed, downgrading to empty-source answer");
            bus.emit(
                ProgressEvent::new(Phase::Reduce, EventStatus::Failed, "reduce: failed")
                    .for_expert(expert.id.clone()),
            );
            let (comment_groups, _) = run_comment_pipeline(
                ctx,
                bus,
                expert,
                request.question,
                &[],
                request.cutoff,
                false,
                request.include_comment_groups,
            )
            .await;
            return ExpertAnswer {
                expert_id: expert.id.clone(),
                expert_name: expert.display_name.clone(),
                channel_handle: expert.channel_handle.clone(),
                answer_markdown: "This expert's answer could not be synthesized.".to_string(),
                main_sources: Vec::new(),
                confidence: Confidence::Low,
                posts_analyzed,
                processing_time_ms: started.elapsed().as_millis() as u64,
                comment_groups,
                comment_synthesis: None,
                translation_applied: false,
            };
        }
    };
    bus.emit(
        ProgressEvent::new(Phase::Reduce, EventStatus::Completed, "reduce: answer ready")
            .for_expert(expert.id.clone()),
    );

    unwind_if_done!(posts_analyzed);

    bus.emit(
        ProgressEvent::new(Phase::LanguageCheck, EventStatus::Started, "language-check: comparing query/answer language")
            .for_expert(expert.id.clone()),
    );
    let (language_output, (comment_groups, comment_synthesis)) = tokio::join!(
        language_check::run_language_check(ctx, &expert.id, request.question, &reduce_output.answer_markdown),
        run_comment_pipeline(
            ctx,
            bus,
            expert,
            request.question,
            &reduce_output.main_sources,
            request.cutoff,
            true,
            request.include_comment_groups,
        ),
    );
    bus.emit(
        ProgressEvent::new(Phase::LanguageCheck, EventStatus::Completed, "language-check: done")
            .for_expert(expert.id.clone()),
    );

    ExpertAnswer {
        expert_id: expert.id.clone(),
        expert_name: expert.display_name.clone(),
        channel_handle: expert.channel_handle.clone(),
        answer_markdown: language_output.answer_markdown,
        main_sources: reduce_output.main_sources,
        confidence: reduce_output.confidence,
        posts_analyzed,
        processing_time_ms: started.elapsed().as_millis() as u64,
        comment_groups,
        comment_synthesis,
        translation_applied: language_output.translation_applied,
    }
}

fn apology_answer(expert: &Expert, message: &str, posts_analyzed: usize, started: Instant) -> ExpertAnswer {
    ExpertAnswer {
        expert_id: expert.id.clone(),
        expert_name: expert.display_name.clone(),
        channel_handle: expert.channel_handle.clone(),
        answer_markdown: message.to_string(),
        main_sources: Vec::new(),
        confidence: Confidence::Low,
        posts_analyzed,
        processing_time_ms: started.elapsed().as_millis() as u64,
        comment_groups: Vec::new(),
        comment_synthesis: None,
        translation_applied: false,
    }
}

/// Comment-Group (and, when `run_synthesis`, Comment-Synthesis) run
/// alongside Language-Check per spec §4.11 step 6. Store errors degrade to
/// an empty group list rather than failing the expert (spec §7).
async fn run_comment_pipeline(
    ctx: &StageContext,
    bus: &ProgressBus,
    expert: &Expert,
    question: &str,
    main_sources: &[i64],
    cutoff: Option<DateTime<Utc>>,
    run_synthesis: bool,
    include_comment_groups: bool,
) -> (Vec<CommentGroupResult>, Option<String>) {
    if !include_comment_groups {
        return (Vec::new(), None);
    }

    bus.emit(
        ProgressEvent::new(Phase::CommentGroups, EventStatus::Started, "comment-group: scanning discussions")
            .for_expert(expert.id.clone()),
    );
    let groups = match comment_group::run_comment_group(
        ctx,
        &expert.id,
        &expert.channel_handle,
        question,
        main_sources,
        cutoff,
    )
    .await
    {
        Ok(groups) => groups,
        Err(err) => {
            tracing::warn!(expert_id = %expert.id, error = %err, "Comment-Group: store error, omitting comment groups");
            Vec::new()
        }
    };
    bus.emit(
        ProgressEvent::new(
            Phase::CommentGroups,
            EventStatus::Completed,
            format!("comment-group: {} group(s) selected", groups.len()),
        )
        .for_expert(expert.id.clone()),
    );

    if !run_synthesis || groups.is_empty() {
        return (groups, None);
    }

    bus.emit(
        ProgressEvent::new(Phase::CommentSynthesis, EventStatus::Started, "comment-synthesis: summarizing")
            .for_expert(expert.id.clone()),
    );
    let synthesis = comment_synthesis::run_comment_synthesis(ctx, &expert.id, &groups).await;
    bus.emit(
        ProgressEvent::new(Phase::CommentSynthesis, EventStatus::Completed, "comment-synthesis: done")
            .for_expert(expert.id.clone()),
    );

    (groups, synthesis)
}
