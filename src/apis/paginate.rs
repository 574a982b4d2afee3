use std::time::Duration;

use async_trait::async_trait;

use super::http::pause;
use super::SourceError;
use crate::record::{CanonicalRecord, Source};

/// Hard stop for runaway pagination.
pub const MAX_PAGES: usize = 10_000;

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Zero-based position in the result set.
    Offset(usize),
    /// Opaque continuation token or link supplied by the previous page.
    Link(String),
}

impl Cursor {
    pub fn offset(&self) -> Option<usize> {
        match self {
            Cursor::Offset(n) => Some(*n),
            Cursor::Link(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Page {
    /// Records kept after client-side filtering.
    pub records: Vec<CanonicalRecord>,
    /// Items the backend returned, before filtering.
    pub raw_len: usize,
    /// Total hit count, when the backend reports one.
    pub total: Option<usize>,
    /// Continuation link or token for the following page.
    pub next: Option<String>,
}

/// One backend page request, bound to a query and its options.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn source(&self) -> Source;

    /// Delay between consecutive page requests.
    fn page_delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError>;
}

/// Drive a [`PageFetcher`] until the result set, the limit or the page cap
/// is exhausted.
///
/// A reported total is authoritative: paging continues past short pages
/// until that many items have been seen. Without a total, a page shorter than
/// `page_size` ends the run. An empty page always ends it.
pub async fn collect<F>(
    fetcher: &F,
    page_size: usize,
    limit: Option<usize>,
) -> Result<Vec<CanonicalRecord>, SourceError>
where
    F: PageFetcher + ?Sized,
{
    let source = fetcher.source();
    let mut records = Vec::new();
    if limit == Some(0) {
        return Ok(records);
    }

    let page_size = page_size.max(1);
    let mut cursor = Cursor::Offset(0);
    let mut seen = 0usize;

    for page_no in 0..MAX_PAGES {
        if page_no > 0 {
            pause(fetcher.page_delay()).await;
        }
        let page = fetcher.fetch_page(&cursor, page_size).await?;
        if page.raw_len == 0 {
            tracing::debug!(%source, page_no, "empty page, stopping");
            break;
        }
        seen += page.raw_len;

        let room = limit.map_or(usize::MAX, |l| l.saturating_sub(records.len()));
        records.extend(page.records.into_iter().take(room));
        tracing::debug!(%source, page_no, seen, kept = records.len(), total = ?page.total, "page fetched");

        if limit.is_some_and(|l| records.len() >= l) {
            break;
        }
        match page.total {
            Some(total) if seen >= total => break,
            None if page.raw_len < page_size => break,
            _ => {}
        }
        if page_no + 1 == MAX_PAGES {
            tracing::warn!(%source, "page cap reached, stopping");
        }
        cursor = match page.next {
            Some(next) => Cursor::Link(next),
            None => Cursor::Offset(seen),
        };
    }

    tracing::info!(%source, count = records.len(), "retrieval finished");
    Ok(records)
}
