//! Cleanup of raw oracle output before decoding.

use once_cell::sync::Lazy;
use regex::Regex;

static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)\s*```").expect("valid regex"));

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

/// Strip reasoning tags and code fences, returning the JSON text.
///
/// When the text has no fence, the outermost `{...}` span is returned so that
/// chatty preambles do not break decoding.
pub fn extract_json(text: &str) -> String {
    let text = THINK_RE.replace_all(text, "");
    let text = text.trim();

    if let Some(content) = CODE_BLOCK_RE
        .captures(text)
        .and_then(|captures| captures.get(1))
    {
        return content.as_str().trim().to_string();
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => text[start..=end].to_string(),
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_code_block() {
        let input = "```json\n{\"decision\": \"merge\"}\n```";
        assert_eq!(extract_json(input), r#"{"decision": "merge"}"#);
    }

    #[test]
    fn test_extract_json_strips_think_tags() {
        let input = "<think>\nthey look alike\n</think>\n{\"decision\": \"keep_separate\"}";
        assert_eq!(extract_json(input), r#"{"decision": "keep_separate"}"#);
    }

    #[test]
    fn test_extract_json_from_prose() {
        let input = "Sure! Here is my answer: {\"decision\": \"merge\"} Hope that helps.";
        assert_eq!(extract_json(input), r#"{"decision": "merge"}"#);
    }

    #[test]
    fn test_extract_json_passthrough() {
        assert_eq!(extract_json("  not json  "), "not json");
    }
}
