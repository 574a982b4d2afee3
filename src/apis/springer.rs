use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

use super::http::Http;
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://api.springernature.com/meta/v2/json";
const DEFAULT_PAGE_SIZE: usize = 25;
const MAX_PAGE_SIZE: usize = 100;
const TIMEOUT: Duration = Duration::from_secs(30);

pub struct SpringerClient {
    http: Http,
    base_url: String,
    api_key: String,
}

impl SpringerClient {
    pub fn new(ctx: &SourceContext, api_key: String) -> Result<Self, SourceError> {
        Ok(Self {
            http: Http::new(Source::SpringerNature, TIMEOUT, ctx)?,
            base_url: BASE_URL.to_string(),
            api_key,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Resolve a `nextPage` link against the API base, keeping the key on it.
    fn next_page_url(&self, next: &str) -> Result<Url, SourceError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| SourceError::Api(format!("invalid URL {}: {}", self.base_url, e)))?;
        let mut url = base
            .join(next)
            .map_err(|e| SourceError::Parse(format!("bad nextPage link {}: {}", next, e)))?;
        if !url.query_pairs().any(|(k, _)| k == "api_key") {
            url.query_pairs_mut().append_pair("api_key", &self.api_key);
        }
        Ok(url)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpringerResponse {
    result: Option<Vec<SpringerResultInfo>>,
    records: Option<Vec<SpringerRecord>>,
    next_page: Option<String>,
}
#[derive(Deserialize)]
struct SpringerResultInfo {
    total: Option<String>,
}
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpringerRecord {
    identifier: Option<String>,
    doi: Option<String>,
    title: Option<String>,
    creators: Option<Vec<SpringerCreator>>,
    publication_name: Option<String>,
    publication_date: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<Value>,
    language: Option<String>,
    content_type: Option<String>,
    openaccess: Option<Value>,
    url: Option<Vec<SpringerUrl>>,
}
#[derive(Deserialize)]
struct SpringerCreator {
    creator: Option<String>,
}
#[derive(Deserialize)]
struct SpringerUrl {
    format: Option<String>,
    value: Option<String>,
}

/// Abstracts arrive either as plain text or as a small section object
/// (`{"h1": "Abstract", "p": ...}`); headings are dropped.
fn abstract_text(value: &Value) -> String {
    fn gather(v: &Value, out: &mut Vec<String>) {
        match v {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|i| gather(i, out)),
            Value::Object(map) => map
                .iter()
                .filter(|(k, _)| k.as_str() != "h1")
                .for_each(|(_, v)| gather(v, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    gather(value, &mut parts);
    normalize::clean_abstract(&parts.join(" "))
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn record_to_canonical(r: SpringerRecord, query_url: &str) -> CanonicalRecord {
    let pdf_url = r
        .url
        .unwrap_or_default()
        .into_iter()
        .find(|u| u.format.as_deref() == Some("pdf"))
        .and_then(|u| u.value);
    RecordDraft {
        native_id: r.identifier,
        authors: r
            .creators
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| c.creator)
            .map(AuthorName::new)
            .collect(),
        title: r.title,
        journal: r.publication_name,
        publication_date: r.publication_date,
        abstract_text: r.abstract_text.as_ref().map(abstract_text),
        doi: r.doi,
        language: r.language,
        type_label: r.content_type.clone(),
        type_crossref: r.content_type,
        is_open_access: r.openaccess.as_ref().and_then(flag),
        pdf_url,
        ..Default::default()
    }
    .build(Source::SpringerNature, query_url)
}

struct SpringerPages<'a> {
    client: &'a SpringerClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

#[async_trait]
impl PageFetcher for SpringerPages<'_> {
    fn source(&self) -> Source {
        Source::SpringerNature
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError> {
        let url = match cursor {
            Cursor::Link(next) => self.client.next_page_url(next)?,
            Cursor::Offset(offset) => {
                // `s` is 1-based.
                let mut params = vec![
                    ("q", self.query.to_string()),
                    ("p", page_size.to_string()),
                    ("s", (offset + 1).to_string()),
                    ("api_key", self.client.api_key.clone()),
                ];
                let (from, to) = self.opts.date_range();
                if let Some(from) = from {
                    params.push(("dateFrom", from.format("%Y-%m-%d").to_string()));
                }
                if let Some(to) = to {
                    params.push(("dateTo", to.format("%Y-%m-%d").to_string()));
                }
                build_url(&self.client.base_url, &params)?
            }
        };
        let resp: SpringerResponse = self.client.http.json(self.client.http.get(url.clone())).await?;

        let records = resp.records.unwrap_or_default();
        let total = resp
            .result
            .as_ref()
            .and_then(|r| r.first())
            .and_then(|r| r.total.as_deref())
            .and_then(|t| t.trim().parse().ok());
        Ok(Page {
            raw_len: records.len(),
            records: records
                .into_iter()
                .map(|r| record_to_canonical(r, url.as_str()))
                .collect(),
            total,
            next: resp.next_page.filter(|n| !n.trim().is_empty()),
        })
    }
}

#[async_trait]
impl PaperSource for SpringerClient {
    fn source(&self) -> Source {
        Source::SpringerNature
    }

    #[tracing::instrument(skip(self, opts), fields(source = "springernature"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = SpringerPages {
            client: self,
            query,
            opts,
        };
        paginate::collect(&pages, opts.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE), opts.max_records).await
    }
}
