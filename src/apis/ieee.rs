use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::http::Http;
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://ieeexploreapi.ieee.org/api/v1/search/articles";
const DEFAULT_PAGE_SIZE: usize = 25;
const MAX_PAGE_SIZE: usize = 200;
const TIMEOUT: Duration = Duration::from_secs(30);

pub struct IeeeClient {
    http: Http,
    base_url: String,
    api_key: String,
}

impl IeeeClient {
    pub fn new(ctx: &SourceContext, api_key: String) -> Result<Self, SourceError> {
        Ok(Self {
            http: Http::new(Source::Ieee, TIMEOUT, ctx)?,
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
struct IeeeResponse {
    total_records: Option<usize>,
    #[serde(default)]
    articles: Vec<IeeeArticle>,
}
#[derive(Deserialize)]
struct IeeeArticle {
    article_number: Option<String>,
    title: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    authors: Option<IeeeAuthors>,
    publication_title: Option<String>,
    publication_year: Option<Value>,
    publication_date: Option<String>,
    doi: Option<String>,
    pdf_url: Option<String>,
    content_type: Option<String>,
    access_type: Option<String>,
    #[serde(alias = "citation_count")]
    citing_paper_count: Option<u64>,
}
#[derive(Deserialize)]
struct IeeeAuthors {
    #[serde(default, alias = "author")]
    authors: Vec<IeeeAuthor>,
}
#[derive(Deserialize)]
struct IeeeAuthor {
    full_name: Option<String>,
    name: Option<String>,
}

/// `publication_year` arrives as a number or a string.
fn year_value(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Free-form dates such as "6-9 Sept. 2021" or "March 2020" to `YYYY[-MM]`.
fn loose_date(text: &str) -> Option<String> {
    let year = normalize::leading_year(text)?;
    let month = text
        .split(|c: char| !c.is_alphabetic())
        .find_map(normalize::month_to_number);
    normalize::partial_date(Some(&year), month.as_deref(), None)
}

fn access_flag(access: Option<&str>) -> Option<bool> {
    match access? {
        "OPEN_ACCESS" => Some(true),
        "LOCKED" => Some(false),
        _ => None,
    }
}

fn article_to_record(a: IeeeArticle, query_url: &str) -> CanonicalRecord {
    let year = a.publication_year.as_ref().and_then(year_value);
    let date = a
        .publication_date
        .as_deref()
        .and_then(loose_date)
        .or_else(|| year.map(|y| y.to_string()));
    RecordDraft {
        native_id: a.article_number,
        authors: a
            .authors
            .map(|list| list.authors)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|au| au.full_name.or(au.name))
            .map(AuthorName::new)
            .collect(),
        title: a.title,
        journal: a.publication_title,
        publication_year: year,
        publication_date: date,
        abstract_text: a.abstract_text.as_deref().map(normalize::clean_abstract),
        doi: a.doi,
        is_published: Some(year.is_some()),
        type_label: a.content_type.clone(),
        type_crossref: a.content_type,
        is_open_access: access_flag(a.access_type.as_deref()),
        pdf_url: a.pdf_url,
        cited_by_count: a.citing_paper_count,
        ..Default::default()
    }
    .build(Source::Ieee, query_url)
}

struct IeeePages<'a> {
    client: &'a IeeeClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

#[async_trait]
impl PageFetcher for IeeePages<'_> {
    fn source(&self) -> Source {
        Source::Ieee
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError> {
        let start = cursor
            .offset()
            .ok_or_else(|| SourceError::Api("IEEE pages by offset only".to_string()))?;
        let mut params = vec![
            ("apikey", self.client.api_key.clone()),
            ("format", "json".to_string()),
            ("querytext", self.query.to_string()),
            ("max_records", page_size.to_string()),
            ("start_record", (start + 1).to_string()),
        ];
        let (from, to) = self.opts.year_range();
        if let Some(from) = from {
            params.push(("start_year", from.to_string()));
        }
        if let Some(to) = to {
            params.push(("end_year", to.to_string()));
        }
        let url = build_url(&self.client.base_url, &params)?;
        let resp: IeeeResponse = self.client.http.json(self.client.http.get(url.clone())).await?;

        Ok(Page {
            raw_len: resp.articles.len(),
            records: resp
                .articles
                .into_iter()
                .map(|a| article_to_record(a, url.as_str()))
                .collect(),
            total: resp.total_records,
            next: None,
        })
    }
}

#[async_trait]
impl PaperSource for IeeeClient {
    fn source(&self) -> Source {
        Source::Ieee
    }

    #[tracing::instrument(skip(self, opts), fields(source = "ieee"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = IeeePages {
            client: self,
            query,
            opts,
        };
        paginate::collect(&pages, opts.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE), opts.max_records).await
    }
}
