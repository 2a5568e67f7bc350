//! `[post:ID]` extraction and post-hoc fact validation (spec §4.7).
//! Grounded on `rag::citation_validator`'s extract -> validate -> confidence
//! shape, with the citation grammar swapped from `file.rs:42` to
//! `[post:123]` and the rule simplified to exact-id membership rather than
//! fuzzy path/line-range matching — a post id is either in the context set
//! or it isn't.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[post:(\d+)\]").expect("citation regex is valid"));

/// All `[post:ID]` ids referenced in `text`, in first-occurrence order,
/// deduplicated.
pub fn extract_citations(text: &str) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for cap in CITATION_RE.captures_iter(text) {
        if let Some(id) = cap.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
            if seen.insert(id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Outcome of validating an answer's citations against its Reduce context.
pub struct FactValidation {
    /// The answer text with unknown `[post:ID]` references stripped out.
    pub sanitized_markdown: String,
    /// Every id the answer cites that IS in the context, plus (per spec
    /// §4.7) every id the context contains that the model should have
    /// cited but didn't is NOT added here — only referenced ids count,
    /// added even if the model's prose under-cites them elsewhere.
    pub main_sources: Vec<i64>,
    /// Ids the answer referenced that were not in the context; removed
    /// from the text and logged as a diagnostic, per spec §4.7.
    pub unknown_references: Vec<i64>,
}

/// Validate all `[post:ID]` references in `answer_markdown` against the set
/// of ids actually present in the context handed to Reduce. Unknown
/// references are stripped from the text; every known reference is
/// promoted into `main_sources` even if the model's answer mentions it
/// only once in passing.
pub fn validate_citations(answer_markdown: &str, context_post_ids: &HashSet<i64>) -> FactValidation {
    let referenced = extract_citations(answer_markdown);

    let mut main_sources = Vec::new();
    let mut unknown_references = Vec::new();
    for id in &referenced {
        if context_post_ids.contains(id) {
            main_sources.push(*id);
        } else {
            unknown_references.push(*id);
        }
    }

    let sanitized_markdown = if unknown_references.is_empty() {
        answer_markdown.to_string()
    } else {
        strip_unknown_references(answer_markdown, context_post_ids)
    };

    if !unknown_references.is_empty() {
        tracing::warn!(
            unknown = ?unknown_references,
            "Reduce answer cited post ids absent from its own context"
        );
    }

    FactValidation {
        sanitized_markdown,
        main_sources,
        unknown_references,
    }
}

fn strip_unknown_references(text: &str, context_post_ids: &HashSet<i64>) -> String {
    CITATION_RE
        .replace_all(text, |caps: &regex::Captures| {
            let id: i64 = caps[1].parse().unwrap_or(-1);
            if context_post_ids.contains(&id) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

/// Strip control characters and attempt to repair a truncated trailing
/// JSON-escape sequence so a downstream JSON consumer can't choke on a
/// half-emitted `\u` escape or a bare trailing backslash (spec §4.7
/// "Sanitization").
pub fn sanitize_for_json(text: &str) -> String {
    let mut cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    // A trailing lone backslash (or an incomplete \u escape) would break
    // a JSON string literal; drop it rather than risk a parse failure
    // downstream.
    while cleaned.ends_with('\\') {
        cleaned.pop();
    }
    cleaned
}
