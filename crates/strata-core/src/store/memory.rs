//! Deterministic in-memory vector store.
//!
//! Points are kept in id order, so scroll pages and search tie-breaks are
//! reproducible. The store can be told how to signal the end of a scroll,
//! and can be made to fail selected calls.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

use crate::error::{ErrorCode, StrataError, StrataResult};
use crate::similarity::{cosine_similarity, dot_product, euclidean_distance};
use crate::traits::{CollectionInfo, DistanceMetric, ScrollPage, VectorRecord, VectorStore};
use crate::types::Filter;

/// How the store reports that a scroll is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorStyle {
    /// `next_offset` is `None`.
    #[default]
    Null,
    /// `next_offset` is an empty string.
    EmptyString,
    /// Every page hands back the same cursor. Models a broken backend.
    Repeating,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    scroll_failures: u32,
    search_failures: u32,
    upsert_failures: u32,
    set_payload_failing_ids: HashSet<String>,
}

/// Calls made against the store, for asserting on side effects.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub scroll: AtomicUsize,
    pub search: AtomicUsize,
    pub retrieve: AtomicUsize,
    pub upsert: AtomicUsize,
    pub set_payload: AtomicUsize,
}

impl CallCounts {
    /// Upsert and payload calls combined.
    pub fn writes(&self) -> usize {
        self.upsert.load(Ordering::SeqCst) + self.set_payload.load(Ordering::SeqCst)
    }
}

/// Process-local [`VectorStore`].
pub struct InMemoryVectorStore {
    collection_name: String,
    dimension: usize,
    distance: DistanceMetric,
    cursor_style: CursorStyle,
    exists: bool,
    points: RwLock<BTreeMap<String, VectorRecord>>,
    faults: Mutex<Faults>,
    calls: CallCounts,
}

impl InMemoryVectorStore {
    /// Create an empty collection.
    pub fn new(collection_name: impl Into<String>, dimension: usize) -> Self {
        Self {
            collection_name: collection_name.into(),
            dimension,
            distance: DistanceMetric::Cosine,
            cursor_style: CursorStyle::Null,
            exists: true,
            points: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            calls: CallCounts::default(),
        }
    }

    /// Use a different distance metric for search scores.
    pub fn with_distance(mut self, distance: DistanceMetric) -> Self {
        self.distance = distance;
        self
    }

    /// Change how the end of a scroll is reported.
    pub fn with_cursor_style(mut self, style: CursorStyle) -> Self {
        self.cursor_style = style;
        self
    }

    /// Model a collection that was never created.
    pub fn missing(mut self) -> Self {
        self.exists = false;
        self
    }

    /// Seed the store.
    pub fn with_records(mut self, records: impl IntoIterator<Item = VectorRecord>) -> Self {
        {
            let points = self.points.get_mut();
            for record in records {
                points.insert(record.id.clone(), record);
            }
        }
        self
    }

    /// Make every call fail as if the store went away.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults().unreachable = unreachable;
    }

    /// Fail the next `n` scroll calls.
    pub fn fail_next_scrolls(&self, n: u32) {
        self.faults().scroll_failures = n;
    }

    /// Fail the next `n` search calls.
    pub fn fail_next_searches(&self, n: u32) {
        self.faults().search_failures = n;
    }

    /// Fail the next `n` upsert calls.
    pub fn fail_next_upserts(&self, n: u32) {
        self.faults().upsert_failures = n;
    }

    /// Fail every payload write to `id`.
    pub fn fail_set_payload_for(&self, id: impl Into<String>) {
        self.faults().set_payload_failing_ids.insert(id.into());
    }

    /// Stop failing payload writes.
    pub fn clear_set_payload_failures(&self) {
        self.faults().set_payload_failing_ids.clear();
    }

    /// All points in id order.
    pub async fn records(&self) -> Vec<VectorRecord> {
        self.points.read().await.values().cloned().collect()
    }

    /// One point by id.
    pub async fn get(&self, id: &str) -> Option<VectorRecord> {
        self.points.read().await.get(id).cloned()
    }

    /// Number of points, ignoring filters.
    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }

    /// Calls made so far.
    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> StrataResult<()> {
        if self.faults().unreachable {
            return Err(StrataError::store_unreachable(format!(
                "in-memory store for '{}' is unreachable",
                self.collection_name
            )));
        }
        if !self.exists {
            return Err(StrataError::VectorStore {
                message: format!("Collection '{}' does not exist", self.collection_name),
                code: ErrorCode::VecCollectionNotFound,
                source: None,
            });
        }
        Ok(())
    }

    fn take_failure(counter: &mut u32, operation: &str) -> StrataResult<()> {
        if *counter > 0 {
            *counter -= 1;
            return Err(StrataError::vector_store(format!(
                "injected {} failure",
                operation
            )));
        }
        Ok(())
    }

    fn score(&self, query: &[f32], vector: &[f32]) -> f32 {
        match self.distance {
            DistanceMetric::Cosine => cosine_similarity(query, vector) as f32,
            DistanceMetric::DotProduct => dot_product(query, vector) as f32,
            DistanceMetric::Euclidean => -(euclidean_distance(query, vector) as f32),
        }
    }

    fn check_dimension(&self, record: &VectorRecord) -> StrataResult<()> {
        if record.vector.len() != self.dimension {
            return Err(StrataError::validation(format!(
                "Vector for '{}' has dimension {}, collection expects {}",
                record.id,
                record.vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }
}

fn matches(filter: &Option<Filter>, record: &VectorRecord) -> bool {
    filter.as_ref().map_or(true, |f| f.matches(&record.payload))
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn require_collection(&self) -> StrataResult<CollectionInfo> {
        self.check_reachable()?;
        Ok(CollectionInfo {
            name: self.collection_name.clone(),
            vector_count: self.points.read().await.len() as u64,
            dimension: self.dimension,
            distance: self.distance,
        })
    }

    async fn scroll(
        &self,
        filter: Option<Filter>,
        offset: Option<String>,
        limit: usize,
    ) -> StrataResult<ScrollPage> {
        self.calls.scroll.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Self::take_failure(&mut self.faults().scroll_failures, "scroll")?;

        let points = self.points.read().await;
        let lower = match offset.filter(|o| !o.is_empty()) {
            Some(id) => Bound::Included(id),
            None => Bound::Unbounded,
        };
        let mut matching = points
            .range::<String, _>((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| matches(&filter, record));

        let page: Vec<VectorRecord> = matching.by_ref().take(limit.max(1)).cloned().collect();
        let next = matching.next().map(|record| record.id.clone());

        let next_offset = match (self.cursor_style, next) {
            (CursorStyle::Repeating, _) => Some("stuck".to_string()),
            (_, Some(id)) => Some(id),
            (CursorStyle::Null, None) => None,
            (CursorStyle::EmptyString, None) => Some(String::new()),
        };

        Ok(ScrollPage {
            points: page,
            next_offset,
        })
    }

    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: Option<Filter>,
    ) -> StrataResult<Vec<VectorRecord>> {
        self.calls.search.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Self::take_failure(&mut self.faults().search_failures, "search")?;

        let points = self.points.read().await;
        let mut scored: Vec<VectorRecord> = points
            .values()
            .filter(|record| matches(&filter, record))
            .map(|record| {
                let mut hit = record.clone();
                hit.score = Some(self.score(query_vector, &record.vector));
                hit
            })
            .collect();

        // Ties keep id order because the map iterates in id order and the
        // sort is stable.
        scored.sort_by(|a, b| {
            let sa = ordered_float::OrderedFloat(a.score.unwrap_or(f32::MIN));
            let sb = ordered_float::OrderedFloat(b.score.unwrap_or(f32::MIN));
            sb.cmp(&sa)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn retrieve(&self, ids: &[String]) -> StrataResult<Vec<VectorRecord>> {
        self.calls.retrieve.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let points = self.points.read().await;
        Ok(ids.iter().filter_map(|id| points.get(id).cloned()).collect())
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> StrataResult<()> {
        self.calls.upsert.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Self::take_failure(&mut self.faults().upsert_failures, "upsert")?;
        for record in &records {
            self.check_dimension(record)?;
        }

        let mut points = self.points.write().await;
        for mut record in records {
            record.score = None;
            points.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn set_payload(
        &self,
        id: &str,
        payload: HashMap<String, serde_json::Value>,
    ) -> StrataResult<()> {
        self.calls.set_payload.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.faults().set_payload_failing_ids.contains(id) {
            return Err(StrataError::vector_store(format!(
                "injected set_payload failure for '{}'",
                id
            )));
        }

        let mut points = self.points.write().await;
        let record = points
            .get_mut(id)
            .ok_or_else(|| StrataError::not_found(id))?;
        record.payload.extend(payload);
        Ok(())
    }

    async fn count(&self, filter: Option<Filter>) -> StrataResult<u64> {
        self.check_reachable()?;
        let points = self.points.read().await;
        Ok(points.values().filter(|r| matches(&filter, r)).count() as u64)
    }

    fn collection_name(&self) -> &str {
        &self.collection_name
    }
}
