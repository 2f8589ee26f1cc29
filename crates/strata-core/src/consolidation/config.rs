//! Consolidation engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{StrataError, StrataResult};
use crate::pressure::PressureConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;

/// Configuration for consolidation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Highest level a fragment can reach. Levels `0..max_level` are scanned.
    pub max_level: u32,
    /// Points per scroll page.
    pub page_size: usize,
    pub grouping: GroupingConfig,
    pub classifier: ClassifierConfig,
    pub merge: MergeConfig,
    pub scheduler: SchedulerConfig,
    /// Backoff for scroll, search, retrieve, upsert, and payload writes.
    pub store_retry: RetryPolicy,
    pub pressure: PressureConfig,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_level: 3,
            page_size: 64,
            grouping: GroupingConfig::default(),
            classifier: ClassifierConfig::default(),
            merge: MergeConfig::default(),
            scheduler: SchedulerConfig::default(),
            store_retry: RetryPolicy::default(),
            pressure: PressureConfig::default(),
        }
    }
}

impl ConsolidationConfig {
    /// Check for values no run can work with.
    pub fn validate(&self) -> StrataResult<()> {
        if self.page_size == 0 {
            return Err(StrataError::Configuration(
                "consolidation.page_size must be at least 1".to_string(),
            ));
        }
        let threshold = self.grouping.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(StrataError::Configuration(format!(
                "consolidation.grouping.similarity_threshold must be within 0..=1, got {}",
                threshold
            )));
        }
        if self.grouping.max_group_size < 2 {
            return Err(StrataError::Configuration(
                "consolidation.grouping.max_group_size must be at least 2".to_string(),
            ));
        }
        if self.grouping.neighbor_limit == 0 {
            return Err(StrataError::Configuration(
                "consolidation.grouping.neighbor_limit must be at least 1".to_string(),
            ));
        }
        if self.classifier.max_attempts == 0 {
            return Err(StrataError::Configuration(
                "consolidation.classifier.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.merge.max_source_ids == 0 {
            return Err(StrataError::Configuration(
                "consolidation.merge.max_source_ids must be at least 1".to_string(),
            ));
        }
        let scheduler = &self.scheduler;
        if scheduler.min_concurrency == 0 {
            return Err(StrataError::Configuration(
                "consolidation.scheduler.min_concurrency must be at least 1".to_string(),
            ));
        }
        if scheduler.min_concurrency > scheduler.max_concurrency {
            return Err(StrataError::Configuration(format!(
                "consolidation.scheduler.min_concurrency ({}) exceeds max_concurrency ({})",
                scheduler.min_concurrency, scheduler.max_concurrency
            )));
        }
        if !(0.0..=1.0).contains(&scheduler.pressure_weight) {
            return Err(StrataError::Configuration(format!(
                "consolidation.scheduler.pressure_weight must be within 0..=1, got {}",
                scheduler.pressure_weight
            )));
        }
        if scheduler.backlog_bound == 0 {
            return Err(StrataError::Configuration(
                "consolidation.scheduler.backlog_bound must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Candidate grouping settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Minimum similarity score for two fragments to be linked.
    pub similarity_threshold: f32,
    /// Neighbors requested per similarity search.
    pub neighbor_limit: usize,
    /// Largest candidate set; bigger components are trimmed.
    pub max_group_size: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            neighbor_limit: 8,
            max_group_size: 8,
        }
    }
}

/// Classifier gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Total oracle calls per candidate set, including the first.
    pub max_attempts: u32,
    /// Deadline for a single oracle call.
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 30_000,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff between oracle attempts.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            initial_delay_ms: self.initial_backoff_ms,
            max_delay_ms: self.max_backoff_ms,
            multiplier: 2.0,
        }
    }
}

/// Merge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Cap on provenance ids kept on a merged fragment.
    pub max_source_ids: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_source_ids: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsolidationConfig::default();
        assert_eq!(config.max_level, 3);
        assert_eq!(config.classifier.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = ConsolidationConfig::default();
        config.scheduler.min_concurrency = 9;
        assert!(config.validate().is_err());

        let mut config = ConsolidationConfig::default();
        config.grouping.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = ConsolidationConfig::default();
        config.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = ConsolidationConfig::default();
        config.classifier.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_classifier_retry_policy_counts_attempts() {
        let classifier = ClassifierConfig::default();
        assert_eq!(classifier.retry_policy().max_retries, 2);
        assert_eq!(classifier.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: ConsolidationConfig =
            serde_json::from_str(r#"{"max_level": 2, "grouping": {"max_group_size": 4}}"#).unwrap();
        assert_eq!(config.max_level, 2);
        assert_eq!(config.grouping.max_group_size, 4);
        assert_eq!(config.grouping.similarity_threshold, 0.85);
        assert_eq!(config.page_size, 64);
    }
}
