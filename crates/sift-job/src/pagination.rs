use async_trait::async_trait;
use log::debug;

use crate::error::JobResult;

/// One page of a listing and the total number of items the server reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: Option<usize>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: vec![],
            total: None,
        }
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    async fn fetch_page(&self, offset: usize, count: usize) -> JobResult<Page<Self::Item>>;
}

/// Walks a listing page by page using `offset` and `count`.
///
/// The total may shrink while the listing is walked, for example when jobs
/// expire. The offset is then clamped to the new total, so the cursor
/// stops instead of requesting past the end.
pub struct PaginationCursor<S: PageSource> {
    source: S,
    offset: usize,
    page_size: usize,
    total_known: Option<usize>,
    exhausted: bool,
}

impl<S: PageSource> PaginationCursor<S> {
    pub fn new(source: S, page_size: usize) -> Self {
        Self {
            source,
            offset: 0,
            page_size: page_size.max(1),
            total_known: None,
            exhausted: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn total_known(&self) -> Option<usize> {
        self.total_known
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Returns the next page, or an empty page once the listing is exhausted.
    /// A failed fetch leaves the cursor unchanged, so it can be retried.
    pub async fn next(&mut self) -> JobResult<Page<S::Item>> {
        if self.exhausted {
            return Ok(Page::empty());
        }
        let count = match self.total_known {
            Some(total) if self.offset >= total => {
                self.exhausted = true;
                return Ok(Page::empty());
            }
            Some(total) => self.page_size.min(total - self.offset),
            None => self.page_size,
        };
        let page = self.source.fetch_page(self.offset, count).await?;
        if let Some(total) = page.total {
            if self.total_known.is_some_and(|known| total < known) {
                debug!("listing total shrank to {total} at offset {}", self.offset);
            }
            self.total_known = Some(total);
            self.offset = self.offset.min(total);
        }
        let received = page.items.len();
        self.offset += received;
        let at_end = self.total_known.is_some_and(|total| self.offset >= total);
        if received == 0 || at_end || (page.total.is_none() && received < count) {
            self.exhausted = true;
        }
        Ok(page)
    }

    /// Fetches all remaining pages.
    pub async fn collect_all(mut self) -> JobResult<Vec<S::Item>> {
        let mut items = vec![];
        loop {
            let page = self.next().await?;
            if page.items.is_empty() {
                return Ok(items);
            }
            items.extend(page.items);
        }
    }
}
