//! Partition a page range into fixed-size batches.

use super::render::PageImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Position of one batch in the plan, computed before any rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpan {
    /// 0-based; shown to people as `batch_num + 1`.
    pub batch_num: usize,
    pub start_page: u32,
    pub end_page: u32,
}

impl BatchSpan {
    pub fn page_count(&self) -> usize {
        (self.end_page - self.start_page + 1) as usize
    }

    pub fn contains(&self, page: u32) -> bool {
        (self.start_page..=self.end_page).contains(&page)
    }
}

/// A planned batch with its rendered pages attached.
///
/// The page images are shared read-only by the text and figure subtasks and
/// released when the batch is dropped.
#[derive(Debug, Clone)]
pub struct Batch {
    pub span: BatchSpan,
    pub pages: Arc<Vec<PageImage>>,
}

impl Batch {
    pub fn new(span: BatchSpan, pages: Vec<PageImage>) -> Self {
        Self {
            span,
            pages: Arc::new(pages),
        }
    }

    pub fn page(&self, page_num: u32) -> Option<&PageImage> {
        self.pages.iter().find(|p| p.page_num == page_num)
    }
}

/// Contiguous windows of `batch_size` pages over `[start_page, end_page]`.
/// The last window may be shorter. Returns an empty plan for an empty range.
pub fn plan_batches(start_page: u32, end_page: u32, batch_size: u32) -> Vec<BatchSpan> {
    if batch_size == 0 || start_page == 0 || start_page > end_page {
        return Vec::new();
    }
    let mut spans = Vec::new();
    let mut start = start_page;
    while start <= end_page {
        let end = start.saturating_add(batch_size - 1).min(end_page);
        spans.push(BatchSpan {
            batch_num: spans.len(),
            start_page: start,
            end_page: end,
        });
        match end.checked_add(1) {
            Some(next) => start = next,
            None => break,
        }
    }
    spans
}
