//! Domain entities per the data model: Expert, Post, Link, Comment, Drift
//! Record plus the transient per-query types the pipeline stages produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An identity owning a disjoint corpus. Registered once, never mutated
/// by the core.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Expert {
    pub id: String,
    pub display_name: String,
    pub channel_handle: String,
}

/// One authored message. The core only ever reads Posts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub expert_id: String,
    pub channel_id: String,
    pub telegram_message_id: i64,
    pub authored_at: DateTime<Utc>,
    pub author_display: String,
    pub body_markdown: String,
    pub forwarded_from: Option<String>,
}

/// The kind of directed relation between two Posts of the same Expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkType {
    Reply,
    Forward,
    Mention,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Link {
    pub source_post_id: i64,
    pub target_post_id: i64,
    pub link_type: LinkType,
}

/// A message attached to an anchor Post. Inherits the anchor's Expert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: i64,
    pub anchor_post_id: i64,
    pub comment_local_id: i64,
    pub author_display: String,
    pub body_markdown: String,
    pub authored_at: DateTime<Utc>,
}

/// A single structured topic a comment thread drifted onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftTopic {
    pub topic: String,
    pub keywords: Vec<String>,
    pub key_phrases: Vec<String>,
    pub context: String,
}

/// One drift analysis outcome per Post whose comment thread has been
/// analyzed offline. `analyzed_by = "pending"` marks an incomplete record
/// awaiting (re-)analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftRecord {
    pub post_id: i64,
    pub expert_id: String,
    pub has_drift: bool,
    pub drift_topics: Vec<DriftTopic>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub analyzed_by: String,
}

/// Relevance tier assigned by Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelevanceLevel {
    High,
    Medium,
    Low,
}

/// A transient per-query Map verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub post_id: i64,
    pub level: RelevanceLevel,
    pub reason: String,
}

/// A transient Medium-Rescue scoring outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPost {
    pub post_id: i64,
    pub score: f32,
    pub reason: String,
}

/// Which tier a post was selected under, feeding Reduce's context-priority rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTier {
    High,
    MediumStar,
    LinkedContext,
}

/// A post chosen for Reduce's context, tagged with the tier it entered under.
#[derive(Debug, Clone)]
pub struct SelectedSource {
    pub post_id: i64,
    pub tier: SourceTier,
    pub post: Post,
}

/// A Post whose comment thread has a completed, has_drift=true analysis,
/// joined with its topics — what `Store::load_drift_groups` hands back.
#[derive(Debug, Clone)]
pub struct DriftAnchor {
    pub post: Post,
    pub drift_topics: Vec<DriftTopic>,
}

/// Confidence assigned to an Expert Answer, per the post-hoc rule in §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// A Comment as rendered into an answer's comment groups — a read-only
/// snapshot, not a live handle back into the Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentSnapshot {
    pub author_display: String,
    pub body_markdown: String,
    pub authored_at: DateTime<Utc>,
}

impl From<&Comment> for CommentSnapshot {
    fn from(c: &Comment) -> Self {
        Self {
            author_display: c.author_display.clone(),
            body_markdown: c.body_markdown.clone(),
            authored_at: c.authored_at,
        }
    }
}

/// One selected comment discussion surfaced alongside the main answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentGroupResult {
    pub anchor_post_id: i64,
    pub anchor_snapshot: String,
    pub telegram_link: String,
    pub comment_count: usize,
    pub relevance: RelevanceLevel,
    pub reason: String,
    pub comments: Vec<CommentSnapshot>,
}

/// The final per-expert output assembled by the Orchestrator. Field names
/// follow spec §3's internal naming; the external wire shape (spec §6)
/// renames four of them, so `Serialize`/`Deserialize` carry `rename` to
/// match that wire contract without renaming the Rust-side fields every
/// stage already uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertAnswer {
    pub expert_id: String,
    pub expert_name: String,
    #[serde(rename = "channel_username")]
    pub channel_handle: String,
    #[serde(rename = "answer")]
    pub answer_markdown: String,
    pub main_sources: Vec<i64>,
    pub confidence: Confidence,
    pub posts_analyzed: usize,
    pub processing_time_ms: u64,
    #[serde(rename = "relevant_comment_groups")]
    pub comment_groups: Vec<CommentGroupResult>,
    #[serde(rename = "comment_groups_synthesis")]
    pub comment_synthesis: Option<String>,
    pub translation_applied: bool,
}

/// Which voice Reduce writes the answer in. Content rules are identical
/// either way; only the system prompt differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceStyle {
    /// First-person mimicry of the expert's voice (default).
    Personal,
    /// Third-person analytical voice.
    Neutral,
}
