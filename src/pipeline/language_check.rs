//! Detect query/answer language mismatch and translate if needed (spec
//! §4.8). Kept isolated from Reduce so a future language pair is a
//! detector + model-tag change, not a rewrite (spec §9).

use super::StageContext;
use crate::citation;
use crate::config::ModelTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    English,
    Russian,
    Other,
}

pub struct LanguageCheckOutput {
    pub answer_markdown: String,
    pub translation_applied: bool,
}

/// The only mismatch pair currently wired up (spec §4.8, §9): an English
/// query answered in Russian. Any other mismatch is a no-op. On
/// translation failure, the original answer is kept and
/// `translation_applied = false`.
pub async fn run_language_check(
    ctx: &StageContext,
    expert_id: &str,
    query: &str,
    answer_markdown: &str,
) -> LanguageCheckOutput {
    let query_lang = detect_lang(query);
    let answer_lang = detect_lang(answer_markdown);

    if query_lang != Lang::English || answer_lang != Lang::Russian {
        return LanguageCheckOutput {
            answer_markdown: answer_markdown.to_string(),
            translation_applied: false,
        };
    }

    match translate_to_english(ctx, answer_markdown).await {
        Ok(translated) => LanguageCheckOutput {
            answer_markdown: translated,
            translation_applied: true,
        },
        Err(err) => {
            tracing::warn!(expert_id, error = %err, "Language-Check: translation failed, keeping original answer");
            LanguageCheckOutput {
                answer_markdown: answer_markdown.to_string(),
                translation_applied: false,
            }
        }
    }
}

/// Cyrillic-range character ratio heuristic: no language-detection crate
/// appears anywhere in the example pack, and the spec names exactly one
/// mismatch pair to detect, so a full language-id model would be solving a
/// problem nobody asked for.
fn detect_lang(text: &str) -> Lang {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return Lang::Other;
    }
    let cyrillic = letters
        .iter()
        .filter(|c| ('\u{0400}'..='\u{04FF}').contains(*c))
        .count();
    let ratio = cyrillic as f32 / letters.len() as f32;
    if ratio > 0.5 {
        Lang::Russian
    } else if ratio < 0.05 {
        Lang::English
    } else {
        Lang::Other
    }
}

async fn translate_to_english(
    ctx: &StageContext,
    answer_markdown: &str,
) -> Result<String, crate::error::GatewayError> {
    let system = "Translate the following Markdown answer from Russian to English. \
         Preserve every `[post:ID]` token exactly as written and preserve all Markdown \
         structure (headings, lists, emphasis) verbatim. Output only the translated text.";

    let translated = crate::llm::retry::with_stage_retry(&ctx.config.retry, || {
        let ctx = ctx.clone();
        let user = answer_markdown.to_string();
        async move {
            ctx.gateway
                .complete_text(ModelTag::Analysis, system, &user, 4096)
                .await
        }
    })
    .await?;

    let original_citations = citation::extract_citations(answer_markdown);
    let translated_citations = citation::extract_citations(&translated);
    if original_citations != translated_citations {
        tracing::warn!(
            "Language-Check: translation dropped or reordered [post:ID] tokens, \
             citation set changed from {:?} to {:?}",
            original_citations,
            translated_citations
        );
    }

    Ok(translated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_english() {
        assert_eq!(detect_lang("What does the author think about agents?"), Lang::English);
    }

    #[test]
    fn detects_russian() {
        assert_eq!(detect_lang("Что думает автор о ИИ агентах?"), Lang::Russian);
    }

    #[test]
    fn empty_text_is_other() {
        assert_eq!(detect_lang("123 [post:1]"), Lang::Other);
    }
}
