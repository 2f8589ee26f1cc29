//! Similarity grouping of scanned fragments into candidate sets.
//!
//! Every unclaimed fragment on a page searches for neighbors at its own
//! level. Neighbors at or above the similarity threshold are linked, and the
//! connected components of those links become candidate sets. A fragment
//! belongs to at most one set per run: once placed (or deferred) it is
//! claimed and later pages skip it.

use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::config::GroupingConfig;
use super::scanner::level_filter;
use crate::error::StrataError;
use crate::retry::{retry_transient, RetryPolicy};
use crate::similarity::cosine_similarity;
use crate::traits::VectorStore;
use crate::types::Fragment;

/// Fragments proposed for joint classification.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// Stable within a run: level plus the first member's id.
    pub id: String,
    pub level: u32,
    /// At least two members, all at `level`.
    pub members: Vec<Fragment>,
}

impl CandidateSet {
    pub fn new(level: u32, members: Vec<Fragment>) -> Self {
        let id = match members.first() {
            Some(first) => format!("L{}-{}", level, first.id),
            None => format!("L{}-empty", level),
        };
        Self { id, level, members }
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|f| f.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A neighbor search that failed after retries.
#[derive(Debug)]
pub struct SearchFailure {
    pub fragment_id: String,
    pub error: StrataError,
}

/// Result of grouping one page.
#[derive(Debug, Default)]
pub struct GroupingOutcome {
    pub sets: Vec<CandidateSet>,
    /// Members trimmed from oversized components, left for a later run.
    pub deferred: Vec<String>,
    pub search_failures: Vec<SearchFailure>,
}

/// Builds candidate sets from scan pages.
#[derive(Clone)]
pub struct CandidateGrouper {
    store: Arc<dyn VectorStore>,
    config: GroupingConfig,
    retry: RetryPolicy,
}

impl CandidateGrouper {
    pub fn new(store: Arc<dyn VectorStore>, config: GroupingConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            config,
            retry,
        }
    }

    /// Group `page`, skipping and then extending `claimed`.
    ///
    /// Sets come out in order of their first member's position on the page.
    /// Within a set, page members keep page order and out-of-page neighbors
    /// follow in id order.
    pub async fn group(
        &self,
        page: &[Fragment],
        level: u32,
        claimed: &mut HashSet<String>,
    ) -> GroupingOutcome {
        let mut outcome = GroupingOutcome::default();

        let mut nodes: Vec<Fragment> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for fragment in page {
            if claimed.contains(&fragment.id) || index.contains_key(&fragment.id) {
                continue;
            }
            index.insert(fragment.id.clone(), nodes.len());
            nodes.push(fragment.clone());
        }
        let on_page = nodes.len();

        let mut edges: Vec<(usize, usize)> = Vec::new();
        for source in 0..on_page {
            let fragment = nodes[source].clone();
            if fragment.vector.is_empty() {
                continue;
            }
            let hits = match self.neighbors(&fragment, level).await {
                Ok(hits) => hits,
                Err(error) => {
                    tracing::warn!(
                        fragment_id = %fragment.id,
                        error = %error,
                        "Neighbor search failed"
                    );
                    outcome.search_failures.push(SearchFailure {
                        fragment_id: fragment.id.clone(),
                        error,
                    });
                    continue;
                }
            };

            for neighbor in hits {
                if neighbor.id == fragment.id || claimed.contains(&neighbor.id) {
                    continue;
                }
                let score = neighbor.score.unwrap_or_else(|| {
                    cosine_similarity(&fragment.vector, &neighbor.vector) as f32
                });
                if score < self.config.similarity_threshold {
                    continue;
                }
                let target = match index.get(&neighbor.id) {
                    Some(&i) => i,
                    None => {
                        let i = nodes.len();
                        index.insert(neighbor.id.clone(), i);
                        nodes.push(neighbor);
                        i
                    }
                };
                edges.push((source, target));
            }
        }

        let mut components = UnionFind::<usize>::new(nodes.len());
        for (a, b) in edges {
            components.union(a, b);
        }
        let labels = components.into_labeling();

        // Keyed by smallest member index, which is always a page member.
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut first_of: HashMap<usize, usize> = HashMap::new();
        for (i, label) in labels.iter().enumerate() {
            let first = *first_of.entry(*label).or_insert(i);
            by_root.entry(first).or_default().push(i);
        }

        for (_, mut members) in by_root {
            if members.len() < 2 {
                continue;
            }
            // Out-of-page neighbors after page members, in id order.
            members.sort_by(|&a, &b| match (a < on_page, b < on_page) {
                (true, true) => a.cmp(&b),
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (false, false) => nodes[a].id.cmp(&nodes[b].id),
            });

            let (kept, deferred) = self.trim(&nodes, members);
            for &i in kept.iter().chain(deferred.iter()) {
                claimed.insert(nodes[i].id.clone());
            }
            outcome
                .deferred
                .extend(deferred.iter().map(|&i| nodes[i].id.clone()));

            let set = CandidateSet::new(level, kept.iter().map(|&i| nodes[i].clone()).collect());
            tracing::debug!(set_id = %set.id, members = set.len(), "Formed candidate set");
            outcome.sets.push(set);
        }

        outcome
    }

    async fn neighbors(
        &self,
        fragment: &Fragment,
        level: u32,
    ) -> Result<Vec<Fragment>, StrataError> {
        let store = &self.store;
        let filter = level_filter(level);
        let limit = self.config.neighbor_limit + 1;
        let records = retry_transient(&self.retry, "search", || {
            store.search(&fragment.vector, limit, Some(filter.clone()))
        })
        .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| Fragment::from_record(record).ok())
            .filter(|f| f.level() == level && !f.is_superseded())
            .collect())
    }

    /// Keep the `max_group_size` members most similar to the rest of the
    /// component, preserving member order. Ties go to the smaller id.
    fn trim(&self, nodes: &[Fragment], members: Vec<usize>) -> (Vec<usize>, Vec<usize>) {
        let cap = self.config.max_group_size;
        if members.len() <= cap {
            return (members, Vec::new());
        }

        let mut ranked: Vec<(usize, f64)> = members
            .iter()
            .map(|&i| {
                let total: f64 = members
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| cosine_similarity(&nodes[i].vector, &nodes[j].vector))
                    .sum();
                (i, total / (members.len() - 1) as f64)
            })
            .collect();
        ranked.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa).then_with(|| nodes[*a].id.cmp(&nodes[*b].id))
        });

        let keep: HashSet<usize> = ranked.iter().take(cap).map(|(i, _)| *i).collect();
        members.into_iter().partition(|i| keep.contains(i))
    }
}
