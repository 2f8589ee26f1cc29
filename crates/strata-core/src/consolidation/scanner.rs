//! Cursor-based traversal of one consolidation level.

use futures::Stream;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ErrorCode, StrataError, StrataResult};
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::VectorStore;
use crate::types::{keys, Filter, Fragment};

/// Active fragments at `level`: exact level match, not superseded.
pub fn level_filter(level: u32) -> Filter {
    Filter::and(vec![
        Filter::eq(keys::CONSOLIDATION_LEVEL, level),
        Filter::not_exists(keys::SUPERSEDED_BY),
    ])
}

/// A point the scanner refused to hand on.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPoint {
    pub id: String,
    pub reason: String,
}

/// One page of a level scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    /// Zero-based page number within the scan.
    pub index: usize,
    /// Active fragments at the scanned level, in store order.
    pub fragments: Vec<Fragment>,
    pub skipped: Vec<SkippedPoint>,
}

/// Creates level scans over one store.
#[derive(Clone)]
pub struct LevelScanner {
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
}

impl LevelScanner {
    pub fn new(store: Arc<dyn VectorStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Start a fresh scan of `level` from the beginning.
    pub fn scan(&self, level: u32, page_size: usize) -> LevelScan {
        LevelScan {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
            level,
            page_size: page_size.max(1),
            cursor: None,
            seen_cursors: HashSet::new(),
            pages: 0,
            exhausted: false,
        }
    }
}

/// A lazy, finite scan of one level.
///
/// The scan ends when the store returns no cursor or an empty one. A cursor
/// the scan has already followed is reported as an error instead of looping.
pub struct LevelScan {
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
    level: u32,
    page_size: usize,
    cursor: Option<String>,
    seen_cursors: HashSet<String>,
    pages: usize,
    exhausted: bool,
}

impl LevelScan {
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Cursor the next page will be fetched from.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Pages yielded so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Fetch the next page. `Ok(None)` once the scan is exhausted.
    ///
    /// After an error the scan is exhausted.
    pub async fn next_page(&mut self) -> StrataResult<Option<ScanPage>> {
        loop {
            if self.exhausted {
                return Ok(None);
            }

            let filter = level_filter(self.level);
            let cursor = self.cursor.clone();
            let store = &self.store;
            let page_size = self.page_size;
            let page = match retry_transient(&self.retry, "scroll", || {
                store.scroll(Some(filter.clone()), cursor.clone(), page_size)
            })
            .await
            {
                Ok(page) => page,
                Err(err) => {
                    self.exhausted = true;
                    return Err(err);
                }
            };

            let next = page.next_offset.filter(|c| !c.is_empty());
            match &next {
                Some(c) if self.cursor.as_deref() == Some(c.as_str())
                    || self.seen_cursors.contains(c) =>
                {
                    self.exhausted = true;
                    return Err(StrataError::VectorStore {
                        message: format!(
                            "Scroll of level {} returned cursor '{}' again",
                            self.level, c
                        ),
                        code: ErrorCode::VecCursorStalled,
                        source: None,
                    });
                }
                Some(c) => {
                    self.seen_cursors.insert(c.clone());
                }
                None => self.exhausted = true,
            }
            self.cursor = next;

            // An empty page with a live cursor carries nothing to hand on.
            if page.points.is_empty() {
                continue;
            }

            let mut fragments = Vec::with_capacity(page.points.len());
            let mut skipped = Vec::new();
            for record in page.points {
                let id = record.id.clone();
                match Fragment::from_record(record) {
                    Ok(f) if f.level() != self.level => skipped.push(SkippedPoint {
                        id,
                        reason: format!("level {} does not match scan level {}", f.level(), self.level),
                    }),
                    Ok(f) if f.is_superseded() => skipped.push(SkippedPoint {
                        id,
                        reason: "superseded".to_string(),
                    }),
                    Ok(f) => fragments.push(f),
                    Err(err) => skipped.push(SkippedPoint {
                        id,
                        reason: err.to_string(),
                    }),
                }
            }

            let index = self.pages;
            self.pages += 1;
            tracing::debug!(
                level = self.level,
                page = index,
                fragments = fragments.len(),
                skipped = skipped.len(),
                "Scanned page"
            );
            return Ok(Some(ScanPage {
                index,
                fragments,
                skipped,
            }));
        }
    }

    /// Consume the scan as a stream of pages. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = StrataResult<ScanPage>> {
        futures::stream::unfold(self, |mut scan| async move {
            match scan.next_page().await {
                Ok(Some(page)) => Some((Ok(page), scan)),
                Ok(None) => None,
                Err(err) => Some((Err(err), scan)),
            }
        })
    }
}
