//! Defensive JSON-mode parsing. Generalizes
//! `reranking::llm_reranker::parse_ranking`'s three-tier strategy from
//! "ranked integer list" to "arbitrary JSON value matching a schema hint":
//! strip code fences, skip leading prose, discard trailing commentary.

use serde_json::Value as JsonValue;

/// Build the system prompt the Gateway sends when a stage requests JSON:
/// the caller's system prompt plus an instruction pinning the output shape.
pub fn frame_system_prompt(system_prompt: &str, schema_hint: &str) -> String {
    format!(
        "{system_prompt}\n\n\
         Respond with a single JSON value matching this shape: {schema_hint}\n\
         Output ONLY the JSON value. Do not wrap it in code fences or add \
         any commentary before or after it."
    )
}

/// Parse a provider response into a JSON value, defending against the
/// three documented failure shapes (spec §4.1, §9):
/// (a) code-fenced JSON, (b) leading prose, (c) trailing explanation.
pub fn parse_json_response(raw: &str) -> Result<JsonValue, String> {
    let trimmed = strip_code_fences(raw);

    // Strategy 1: the whole trimmed body is valid JSON.
    if let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) {
        return Ok(value);
    }

    // Strategy 2: find the first balanced JSON object or array substring.
    if let Some(slice) = find_first_json_value(trimmed) {
        if let Ok(value) = serde_json::from_str::<JsonValue>(slice) {
            return Ok(value);
        }
    }

    Err(format!(
        "could not parse JSON from response: {}",
        trimmed.chars().take(200).collect::<String>()
    ))
}

fn strip_code_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Scan for the first top-level `{...}` or `[...]` span, tracking nesting
/// depth and string/escape state so embedded braces inside string values
/// don't terminate the scan early.
fn find_first_json_value(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find(['{', '['])?;
    let opening = bytes[start];
    let closing = if opening == b'{' { b'}' } else { b']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b if b == opening => depth += 1,
            b if b == closing => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    None
}
