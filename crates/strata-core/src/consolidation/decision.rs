//! Classification decisions and their decoding.
//!
//! Oracle output is untrusted. It is decoded as a tagged variant and then
//! checked against the candidate set it answers; anything that fails either
//! step is an error the gateway turns into [`ClassificationDecision::KeepSeparate`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;

use super::json::extract_json;
use crate::error::{ErrorCode, StrataError, StrataResult};

/// Name of the response schema sent to the oracle.
pub const DECISION_SCHEMA_NAME: &str = "consolidation_decision";

/// What to do with one candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ClassificationDecision {
    /// Merge every member into one fragment with this content.
    Merge { merged_content: String },
    /// Leave every member untouched.
    KeepSeparate,
    /// Merge each subgroup on its own; members outside all subgroups stay.
    PartialMerge { subgroups: Vec<Subgroup> },
}

/// One subgroup of a partial merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgroup {
    pub member_ids: Vec<String>,
    pub merged_content: String,
}

impl ClassificationDecision {
    /// Short label for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Merge { .. } => "merge",
            Self::KeepSeparate => "keep_separate",
            Self::PartialMerge { .. } => "partial_merge",
        }
    }
}

// Wire shape. Every field is present in the schema; the tag picks which ones
// matter.
#[derive(Debug, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
enum RawDecision {
    Merge {
        merged_content: Option<String>,
    },
    KeepSeparate,
    PartialMerge {
        #[serde(default)]
        subgroups: Vec<RawSubgroup>,
    },
}

#[derive(Debug, Deserialize)]
struct RawSubgroup {
    member_ids: Vec<String>,
    merged_content: Option<String>,
}

/// JSON schema describing the decision shape.
pub fn decision_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "decision": {
                "type": "string",
                "enum": ["merge", "keep_separate", "partial_merge"]
            },
            "merged_content": {
                "type": ["string", "null"],
                "description": "Combined content when decision is merge"
            },
            "subgroups": {
                "type": "array",
                "description": "Groups to merge when decision is partial_merge",
                "items": {
                    "type": "object",
                    "properties": {
                        "member_ids": {
                            "type": "array",
                            "items": { "type": "string" }
                        },
                        "merged_content": { "type": "string" }
                    },
                    "required": ["member_ids", "merged_content"],
                    "additionalProperties": false
                }
            },
            "rationale": { "type": "string" }
        },
        "required": ["decision", "merged_content", "subgroups", "rationale"],
        "additionalProperties": false
    })
}

fn invalid(message: impl Into<String>) -> StrataError {
    StrataError::Validation {
        message: message.into(),
        code: ErrorCode::ValInvalidFormat,
        details: Default::default(),
        suggestion: None,
    }
}

fn non_empty(content: Option<String>, what: &str) -> StrataResult<String> {
    match content.map(|c| c.trim().to_string()) {
        Some(c) if !c.is_empty() => Ok(c),
        _ => Err(invalid(format!("{} has no merged content", what))),
    }
}

/// Decode and validate an oracle response for the set with `member_ids`.
pub fn decode_decision(response: &str, member_ids: &[String]) -> StrataResult<ClassificationDecision> {
    let json_text = extract_json(response);
    if json_text.is_empty() {
        return Err(StrataError::parse("Empty classification response"));
    }

    let raw: RawDecision = serde_json::from_str(&json_text).map_err(|e| StrataError::Parse {
        message: format!("Failed to parse classification JSON: {}", e),
        code: ErrorCode::ParseInvalidJson,
    })?;

    match raw {
        RawDecision::KeepSeparate => Ok(ClassificationDecision::KeepSeparate),
        RawDecision::Merge { merged_content } => Ok(ClassificationDecision::Merge {
            merged_content: non_empty(merged_content, "merge decision")?,
        }),
        RawDecision::PartialMerge { subgroups } => {
            if subgroups.is_empty() {
                return Err(invalid("partial_merge decision has no subgroups"));
            }
            let known: HashSet<&str> = member_ids.iter().map(String::as_str).collect();
            let mut used: HashSet<String> = HashSet::new();
            let mut validated = Vec::with_capacity(subgroups.len());

            for (index, subgroup) in subgroups.into_iter().enumerate() {
                if subgroup.member_ids.len() < 2 {
                    return Err(invalid(format!(
                        "subgroup {} has fewer than two members",
                        index
                    )));
                }
                for id in &subgroup.member_ids {
                    if !known.contains(id.as_str()) {
                        return Err(invalid(format!(
                            "subgroup {} names '{}', which is not in the candidate set",
                            index, id
                        )));
                    }
                    if !used.insert(id.clone()) {
                        return Err(invalid(format!(
                            "'{}' appears in more than one subgroup",
                            id
                        )));
                    }
                }
                validated.push(Subgroup {
                    member_ids: subgroup.member_ids,
                    merged_content: non_empty(
                        subgroup.merged_content,
                        &format!("subgroup {}", index),
                    )?,
                });
            }

            Ok(ClassificationDecision::PartialMerge {
                subgroups: validated,
            })
        }
    }
}
