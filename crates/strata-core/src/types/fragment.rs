//! Fragment types: the typed view over a stored point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::{StrataError, StrataResult};
use crate::traits::VectorRecord;

/// Payload keys written and read by the consolidation engine.
pub mod keys {
    pub const CONTENT: &str = "content";
    pub const CONSOLIDATION_LEVEL: &str = "consolidation_level";
    pub const SOURCE_IDS: &str = "source_ids";
    pub const CREATED_AT: &str = "created_at";
    pub const LAST_CONSOLIDATED_AT: &str = "last_consolidated_at";
    pub const SUPERSEDED_BY: &str = "superseded_by";
    pub const SOURCE_IDS_TRUNCATED: &str = "source_ids_truncated";
    pub const HASH: &str = "hash";
}

/// Decoded fragment payload.
///
/// Keys the engine does not know about are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentPayload {
    /// The memory content.
    pub content: String,
    /// Consolidation tier, 0 for raw ingested fragments.
    pub consolidation_level: u32,
    /// Provenance of merges, oldest first.
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_consolidated_at: Option<DateTime<Utc>>,
    /// Id of the promoted fragment that retired this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub source_ids_truncated: bool,
    /// MD5 hash of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl FragmentPayload {
    /// Create a payload for a fresh fragment at the given level.
    pub fn new(content: impl Into<String>, consolidation_level: u32) -> Self {
        let content = content.into();
        Self {
            hash: Some(content_hash(&content)),
            content,
            consolidation_level,
            source_ids: Vec::new(),
            created_at: Some(Utc::now()),
            last_consolidated_at: None,
            superseded_by: None,
            source_ids_truncated: false,
            extra: HashMap::new(),
        }
    }

    /// Set the provenance list.
    pub fn with_source_ids(mut self, source_ids: Vec<String>) -> Self {
        self.source_ids = source_ids;
        self
    }

    /// Set the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Decode from an untyped store payload.
    pub fn from_map(payload: &HashMap<String, Value>) -> StrataResult<Self> {
        let object: serde_json::Map<String, Value> = payload
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(Value::Object(object)).map_err(|e| StrataError::Parse {
            message: format!("Invalid fragment payload: {}", e),
            code: crate::error::ErrorCode::FrgCorrupted,
        })
    }

    /// Encode into an untyped store payload.
    pub fn to_map(&self) -> StrataResult<HashMap<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(object) => Ok(object.into_iter().collect()),
            other => Err(StrataError::Internal(format!(
                "Fragment payload serialized to non-object: {}",
                other
            ))),
        }
    }
}

/// A stored memory unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Unique, stable identifier.
    pub id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Decoded payload.
    pub payload: FragmentPayload,
    /// Similarity score, set when the fragment came from a search.
    pub score: Option<f32>,
}

impl Fragment {
    /// Create a new fragment.
    pub fn new(id: impl Into<String>, vector: Vec<f32>, payload: FragmentPayload) -> Self {
        Self {
            id: id.into(),
            vector,
            payload,
            score: None,
        }
    }

    /// Decode a fragment from a store record.
    pub fn from_record(record: VectorRecord) -> StrataResult<Self> {
        let payload = FragmentPayload::from_map(&record.payload)?;
        Ok(Self {
            id: record.id,
            vector: record.vector,
            payload,
            score: record.score,
        })
    }

    /// Encode the fragment as a store record.
    pub fn into_record(self) -> StrataResult<VectorRecord> {
        let payload = self.payload.to_map()?;
        Ok(VectorRecord {
            id: self.id,
            vector: self.vector,
            payload,
            score: self.score,
        })
    }

    /// Consolidation level.
    pub fn level(&self) -> u32 {
        self.payload.consolidation_level
    }

    /// The memory content.
    pub fn content(&self) -> &str {
        &self.payload.content
    }

    /// Whether a promoted fragment has retired this one.
    pub fn is_superseded(&self) -> bool {
        self.payload
            .superseded_by
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    /// The ids this fragment stands for: its recorded provenance, or itself
    /// when it has never been merged.
    pub fn lineage(&self) -> Vec<String> {
        if self.payload.source_ids.is_empty() {
            vec![self.id.clone()]
        } else {
            self.payload.source_ids.clone()
        }
    }
}

/// Provenance of a merged fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub source_ids: Vec<String>,
    /// The list hit the cap and lost its newest entries.
    pub truncated: bool,
}

/// Combine the lineages of `inputs` in order, dropping duplicates and keeping
/// at most `cap` ids (oldest first).
pub fn merge_lineage<'a, I>(inputs: I, cap: usize) -> Lineage
where
    I: IntoIterator<Item = &'a Fragment>,
{
    let mut seen = HashSet::new();
    let mut source_ids = Vec::new();
    let mut truncated = false;

    for fragment in inputs {
        if fragment.payload.source_ids_truncated {
            truncated = true;
        }
        for id in fragment.lineage() {
            if seen.insert(id.clone()) {
                source_ids.push(id);
            }
        }
    }

    if source_ids.len() > cap {
        source_ids.truncate(cap);
        truncated = true;
    }

    Lineage {
        source_ids,
        truncated,
    }
}

/// MD5 hex digest of fragment content.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment(id: &str, level: u32, source_ids: &[&str]) -> Fragment {
        Fragment::new(
            id,
            vec![1.0, 0.0],
            FragmentPayload::new(format!("content of {}", id), level)
                .with_source_ids(source_ids.iter().map(|s| s.to_string()).collect()),
        )
    }

    #[test]
    fn test_payload_round_trip_preserves_unknown_keys() {
        let mut map = HashMap::new();
        map.insert("content".to_string(), json!("hello"));
        map.insert("consolidation_level".to_string(), json!(2));
        map.insert("user_id".to_string(), json!("alice"));

        let payload = FragmentPayload::from_map(&map).unwrap();
        assert_eq!(payload.consolidation_level, 2);
        assert!(payload.source_ids.is_empty());
        assert_eq!(payload.extra.get("user_id"), Some(&json!("alice")));

        let back = payload.to_map().unwrap();
        assert_eq!(back.get("user_id"), Some(&json!("alice")));
        assert!(!back.contains_key("superseded_by"));
    }

    #[test]
    fn test_payload_missing_level_is_rejected() {
        let mut map = HashMap::new();
        map.insert("content".to_string(), json!("hello"));
        assert!(FragmentPayload::from_map(&map).is_err());
    }

    #[test]
    fn test_lineage_falls_back_to_own_id() {
        assert_eq!(fragment("f1", 0, &[]).lineage(), vec!["f1".to_string()]);
        assert_eq!(
            fragment("m1", 1, &["a", "b"]).lineage(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_merge_lineage_order_preserving_union() {
        let a = fragment("A", 0, &["a1"]);
        let b = fragment("B", 1, &["b1", "b2"]);
        let lineage = merge_lineage([&a, &b], 256);
        assert_eq!(lineage.source_ids, vec!["a1", "b1", "b2"]);
        assert!(!lineage.truncated);
    }

    #[test]
    fn test_merge_lineage_dedups_and_caps() {
        let a = fragment("A", 1, &["x", "y"]);
        let b = fragment("B", 1, &["y", "z"]);
        let lineage = merge_lineage([&a, &b], 2);
        assert_eq!(lineage.source_ids, vec!["x", "y"]);
        assert!(lineage.truncated);
    }

    #[test]
    fn test_superseded_flag() {
        let mut f = fragment("f1", 0, &[]);
        assert!(!f.is_superseded());
        f.payload.superseded_by = Some(String::new());
        assert!(!f.is_superseded());
        f.payload.superseded_by = Some("m1".to_string());
        assert!(f.is_superseded());
    }

    #[test]
    fn test_content_hash_is_md5_hex() {
        assert_eq!(content_hash("hello"), "5d41402abc4b2a76b9719d911017c592");
    }
}
