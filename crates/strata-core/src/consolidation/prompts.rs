//! Prompt templates for the classification oracle.

use serde_json::json;

use super::grouper::CandidateSet;
use crate::types::Message;

/// System prompt for merge classification.
pub fn consolidation_prompt() -> &'static str {
    r#"You are a memory consolidation assistant. You receive a set of memory fragments that a similarity search judged to be related, and you decide whether they should be combined.

Choose exactly one decision:
- "merge": every fragment describes the same information. Write one merged_content that preserves every distinct fact from all fragments.
- "keep_separate": the fragments carry different information, conflict, or merging would lose detail.
- "partial_merge": only some fragments belong together. List each group of at least two fragment ids in subgroups, with the merged_content for that group. A fragment may appear in at most one subgroup; fragments left out stay as they are.

Rules:
1. Never invent facts that are not present in the fragments.
2. Prefer keep_separate when unsure.
3. Use only the fragment ids you were given.

Respond with a single JSON object:
{
    "decision": "merge|keep_separate|partial_merge",
    "merged_content": "<text when decision is merge, else null>",
    "subgroups": [{"member_ids": ["<id>", "<id>"], "merged_content": "<text>"}],
    "rationale": "<one sentence>"
}
"#
}

/// Build the oracle messages for one candidate set.
pub fn build_classification_messages(set: &CandidateSet) -> Vec<Message> {
    let fragments: Vec<serde_json::Value> = set
        .members
        .iter()
        .map(|f| json!({ "id": f.id, "content": f.content() }))
        .collect();
    let fragments_json =
        serde_json::to_string_pretty(&fragments).unwrap_or_else(|_| "[]".to_string());

    vec![
        Message::system(consolidation_prompt()),
        Message::user(format!(
            "Consolidation level: {}\n\nFragments:\n```\n{}\n```",
            set.level, fragments_json
        )),
    ]
}
