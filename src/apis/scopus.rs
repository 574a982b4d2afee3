use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde::Deserialize;

use super::http::Http;
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://api.elsevier.com/content/search/scopus";
/// Scopus Search caps `count` at 25 for standard keys.
const MAX_PAGE_SIZE: usize = 25;
const TIMEOUT: Duration = Duration::from_secs(30);
const EARLIEST_YEAR: i32 = 1900;

pub struct ScopusClient {
    http: Http,
    base_url: String,
    api_key: String,
}

impl ScopusClient {
    pub fn new(ctx: &SourceContext, api_key: String) -> Result<Self, SourceError> {
        Ok(Self {
            http: Http::new(Source::Scopus, TIMEOUT, ctx)?,
            base_url: BASE_URL.to_string(),
            api_key,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct ScopusResponse {
    #[serde(rename = "search-results")]
    search_results: ScopusResults,
}
#[derive(Deserialize)]
struct ScopusResults {
    #[serde(rename = "opensearch:totalResults")]
    total_results: Option<String>,
    #[serde(default)]
    entry: Vec<ScopusEntry>,
}
#[derive(Deserialize)]
struct ScopusEntry {
    /// Present on the placeholder entry of an empty result set.
    error: Option<String>,
    eid: Option<String>,
    #[serde(rename = "dc:title")]
    title: Option<String>,
    #[serde(rename = "dc:creator")]
    creator: Option<String>,
    #[serde(rename = "prism:publicationName")]
    publication_name: Option<String>,
    #[serde(rename = "prism:coverDate")]
    cover_date: Option<String>,
    #[serde(rename = "prism:doi")]
    doi: Option<String>,
    #[serde(rename = "prism:aggregationType")]
    aggregation_type: Option<String>,
    #[serde(rename = "dc:description")]
    description: Option<String>,
    #[serde(rename = "citedby-count")]
    cited_by: Option<String>,
    #[serde(rename = "subtypeDescription")]
    subtype: Option<String>,
    #[serde(rename = "openaccessFlag")]
    open_access: Option<bool>,
}

/// `dc:creator` is "Surname I." style; the surname is everything before the
/// trailing initials.
fn creator_name(creator: &str) -> AuthorName {
    let family: Vec<&str> = creator
        .split_whitespace()
        .take_while(|tok| !tok.ends_with('.'))
        .collect();
    AuthorName {
        full: creator.trim().to_string(),
        family: (!family.is_empty()).then(|| family.join(" ")),
    }
}

fn entry_to_record(e: ScopusEntry, query_url: &str) -> CanonicalRecord {
    RecordDraft {
        native_id: e.eid,
        authors: e.creator.as_deref().map(creator_name).into_iter().collect(),
        title: e.title,
        is_published: Some(e.publication_name.is_some()),
        journal: e.publication_name,
        publication_date: e.cover_date,
        abstract_text: e.description.as_deref().map(normalize::clean_abstract),
        doi: e.doi,
        type_label: e.subtype,
        type_crossref: e.aggregation_type,
        is_open_access: e.open_access,
        cited_by_count: e.cited_by.and_then(|c| c.trim().parse().ok()),
        ..Default::default()
    }
    .build(Source::Scopus, query_url)
}

struct ScopusPages<'a> {
    client: &'a ScopusClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

impl ScopusPages<'_> {
    fn date(&self) -> Option<String> {
        match self.opts.year_range() {
            (None, None) => None,
            (start, end) => Some(format!(
                "{}-{}",
                start.unwrap_or(EARLIEST_YEAR),
                end.unwrap_or_else(|| Utc::now().year())
            )),
        }
    }
}

#[async_trait]
impl PageFetcher for ScopusPages<'_> {
    fn source(&self) -> Source {
        Source::Scopus
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError> {
        let start = cursor
            .offset()
            .ok_or_else(|| SourceError::Api("Scopus pages by offset only".to_string()))?;
        let mut params = vec![
            ("query", self.query.to_string()),
            ("start", start.to_string()),
            ("count", page_size.to_string()),
        ];
        if let Some(date) = self.date() {
            params.push(("date", date));
        }
        let url = build_url(&self.client.base_url, &params)?;
        let req = self
            .client
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .header("X-ELS-APIKey", &self.client.api_key);
        let resp: ScopusResponse = self.client.http.json(req).await?;

        let results = resp.search_results;
        let entries: Vec<ScopusEntry> = results.entry.into_iter().filter(|e| e.error.is_none()).collect();
        Ok(Page {
            raw_len: entries.len(),
            records: entries
                .into_iter()
                .map(|e| entry_to_record(e, url.as_str()))
                .collect(),
            total: results.total_results.and_then(|t| t.trim().parse().ok()),
            next: None,
        })
    }
}

#[async_trait]
impl PaperSource for ScopusClient {
    fn source(&self) -> Source {
        Source::Scopus
    }

    #[tracing::instrument(skip(self, opts), fields(source = "scopus"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = ScopusPages {
            client: self,
            query,
            opts,
        };
        paginate::collect(&pages, opts.page_size(MAX_PAGE_SIZE, MAX_PAGE_SIZE), opts.max_records).await
    }
}
