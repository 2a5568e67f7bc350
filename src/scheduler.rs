//! Multi-Expert Scheduler (spec §4.12): resolves the expert set, fans out
//! one Orchestrator per expert under a bounded semaphore, and assembles a
//! single response. Grounded on `ConaryLabs-Mira::experts::council::execute_phase`'s
//! `stream::iter(tasks).buffer_unordered(N)` shape with per-task failure
//! tolerance, generalized here so a single expert's failure never drops
//! the request — only that expert's answer degrades.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::date_util::recent_cutoff;
use crate::pipeline::orchestrator::{run_orchestrator, OrchestratorRequest};
use crate::pipeline::StageContext;
use crate::progress::{EventStatus, Phase, ProgressBus, ProgressEvent};
use crate::store;
use crate::types::{Expert, ExpertAnswer, ReduceStyle};

pub struct QueryPlan {
    pub query: String,
    pub expert_filter: Option<Vec<String>>,
    pub max_posts: Option<usize>,
    pub use_recent_only: bool,
    pub include_comment_groups: bool,
    pub use_personal_style: bool,
}

/// Run every requested expert's Orchestrator concurrently and assemble
/// their answers in a stable order (spec §4.12 step 4: the order experts
/// were resolved in, not completion order).
pub async fn run_scheduler(
    ctx: &StageContext,
    bus: &ProgressBus,
    cancellation: &CancellationToken,
    plan: QueryPlan,
    now: DateTime<Utc>,
) -> Vec<ExpertAnswer> {
    let experts = match resolve_experts(ctx, bus, plan.expert_filter.as_deref()).await {
        Ok(experts) => experts,
        Err(err) => {
            tracing::error!(error = %err, "Scheduler: failed to resolve expert set");
            bus.emit(ProgressEvent::new(Phase::Complete, EventStatus::Completed, "no experts resolved"));
            return Vec::new();
        }
    };

    let cutoff = plan
        .use_recent_only
        .then(|| recent_cutoff(now, ctx.config.recent_window_months));
    let style = if plan.use_personal_style { ReduceStyle::Personal } else { ReduceStyle::Neutral };
    let concurrency = ctx.config.max_concurrent_experts.max(1);

    let tasks = experts.into_iter().enumerate().map(|(index, expert)| {
        let ctx = ctx.clone();
        let bus = bus.clone();
        let cancellation = cancellation.clone();
        let question = plan.query.clone();
        let max_posts = plan.max_posts;
        let include_comment_groups = plan.include_comment_groups;
        async move {
            let answer = run_orchestrator(
                &ctx,
                &bus,
                &cancellation,
                OrchestratorRequest {
                    expert: &expert,
                    question: &question,
                    max_posts,
                    cutoff,
                    style,
                    include_comment_groups,
                },
            )
            .await;
            (index, answer)
        }
    });

    // buffer_unordered yields as each expert finishes, not in submission
    // order; re-sort by the original index so expert_responses stays in a
    // stable order (spec §4.12) regardless of which expert finished first.
    let mut indexed: Vec<(usize, ExpertAnswer)> =
        stream::iter(tasks).buffer_unordered(concurrency).collect().await;
    indexed.sort_by_key(|(index, _)| *index);
    let answers: Vec<ExpertAnswer> = indexed.into_iter().map(|(_, answer)| answer).collect();

    bus.emit(ProgressEvent::new(Phase::Complete, EventStatus::Completed, "all experts finished"));
    answers
}

/// Resolve the expert set: an explicit filter (with unknown ids warned
/// about, not rejected) or every registered expert (spec §4.12 step 1,
/// §8 property 13).
async fn resolve_experts(
    ctx: &StageContext,
    bus: &ProgressBus,
    filter: Option<&[String]>,
) -> Result<Vec<Expert>, crate::error::StorageError> {
    let all = store::experts::list_experts(&ctx.pool).await?;

    let Some(ids) = filter else {
        return Ok(all);
    };

    let mut by_id: std::collections::HashMap<&str, &Expert> =
        all.iter().map(|e| (e.id.as_str(), e)).collect();
    let mut resolved = Vec::new();
    for id in ids {
        match by_id.remove(id.as_str()) {
            Some(expert) => resolved.push(expert.clone()),
            None => {
                tracing::warn!(expert_id = %id, "Scheduler: unknown expert id in expert_filter, skipping");
                bus.emit(ProgressEvent::new(
                    Phase::Map,
                    EventStatus::Failed,
                    format!("unknown expert id '{id}' ignored"),
                ));
            }
        }
    }
    Ok(resolved)
}
