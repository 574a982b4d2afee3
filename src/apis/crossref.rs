use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::http::{Http, USER_AGENT};
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://api.crossref.org/works";
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;
const TIMEOUT: Duration = Duration::from_secs(30);

pub struct CrossRefClient {
    http: Http,
    base_url: String,
    mailto: Option<String>,
}

impl CrossRefClient {
    pub fn new(ctx: &SourceContext, mailto: Option<String>) -> Result<Self, SourceError> {
        let agent = match &mailto {
            Some(email) => format!("{} (mailto:{})", USER_AGENT, email),
            None => USER_AGENT.to_string(),
        };
        let builder = reqwest::Client::builder().user_agent(agent).timeout(TIMEOUT);
        Ok(Self {
            http: Http::build(Source::Crossref, builder, ctx)?,
            base_url: BASE_URL.to_string(),
            mailto,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct CRResponse {
    message: CRMessage,
}
#[derive(Deserialize)]
struct CRMessage {
    #[serde(rename = "total-results")]
    total_results: Option<usize>,
    items: Option<Vec<CRItem>>,
}
#[derive(Deserialize)]
struct CRItem {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    title: Option<Vec<String>>,
    #[serde(rename = "container-title")]
    container_title: Option<Vec<String>>,
    author: Option<Vec<CRAuthor>>,
    issued: Option<CRDate>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    language: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    license: Option<Vec<serde_json::Value>>,
    link: Option<Vec<CRLink>>,
    #[serde(rename = "is-referenced-by-count")]
    citation_count: Option<u64>,
}
#[derive(Deserialize)]
struct CRAuthor {
    given: Option<String>,
    family: Option<String>,
    // Organisational authors
    name: Option<String>,
}
#[derive(Deserialize)]
struct CRDate {
    #[serde(rename = "date-parts")]
    date_parts: Option<Vec<Vec<Option<i64>>>>,
}
#[derive(Deserialize)]
struct CRLink {
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(rename = "content-type")]
    content_type: Option<String>,
}

fn item_to_record(item: CRItem, query_url: &str) -> CanonicalRecord {
    let date = item
        .issued
        .as_ref()
        .and_then(|d| d.date_parts.as_ref())
        .and_then(|p| p.first())
        .and_then(|p| normalize::date_from_parts(p));
    let authors = item
        .author
        .unwrap_or_default()
        .into_iter()
        .map(|a| match (a.given.as_deref(), a.family.as_deref()) {
            (None, None) => AuthorName::new(a.name.unwrap_or_default()),
            (given, family) => AuthorName::structured(given, family),
        })
        .collect();
    let pdf_url = item
        .link
        .as_ref()
        .and_then(|links| {
            links
                .iter()
                .find(|l| l.content_type.as_deref() == Some("application/pdf"))
        })
        .and_then(|l| l.url.clone());
    let licensed = item.license.as_ref().is_some_and(|l| !l.is_empty());

    RecordDraft {
        authors,
        title: item.title.and_then(|t| t.into_iter().next()),
        journal: item.container_title.and_then(|t| t.into_iter().next()),
        is_published: Some(date.is_some()),
        publication_date: date,
        abstract_text: item.abstract_text.as_deref().map(normalize::clean_abstract),
        doi: item.doi,
        language: item.language,
        type_label: item.kind.clone(),
        type_crossref: item.kind,
        is_open_access: licensed.then_some(true),
        oa_status: licensed.then(|| "License available".to_string()),
        pdf_url,
        cited_by_count: item.citation_count,
        ..Default::default()
    }
    .build(Source::Crossref, query_url)
}

struct CrossRefPages<'a> {
    client: &'a CrossRefClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

impl CrossRefPages<'_> {
    fn filter(&self) -> String {
        let mut filters = vec!["type:journal-article".to_string()];
        let (from, to) = self.opts.date_range();
        if let Some(from) = from {
            filters.push(format!("from-pub-date:{}", from.format("%Y-%m-%d")));
        }
        if let Some(to) = to {
            filters.push(format!("until-pub-date:{}", to.format("%Y-%m-%d")));
        }
        filters.join(",")
    }
}

#[async_trait]
impl PageFetcher for CrossRefPages<'_> {
    fn source(&self) -> Source {
        Source::Crossref
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError> {
        let offset = cursor
            .offset()
            .ok_or_else(|| SourceError::Api("Crossref pages by offset only".to_string()))?;
        let mut params = vec![
            ("query", self.query.to_string()),
            ("rows", page_size.to_string()),
            ("offset", offset.to_string()),
            ("filter", self.filter()),
        ];
        if let Some(ref email) = self.client.mailto {
            params.push(("mailto", email.clone()));
        }
        let url = build_url(&self.client.base_url, &params)?;
        let resp: CRResponse = self.client.http.json(self.client.http.get(url.clone())).await?;

        let items = resp.message.items.unwrap_or_default();
        Ok(Page {
            raw_len: items.len(),
            records: items
                .into_iter()
                .map(|item| item_to_record(item, url.as_str()))
                .collect(),
            total: resp.message.total_results,
            next: None,
        })
    }
}

#[async_trait]
impl PaperSource for CrossRefClient {
    fn source(&self) -> Source {
        Source::Crossref
    }

    #[tracing::instrument(skip(self, opts), fields(source = "crossref"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = CrossRefPages {
            client: self,
            query,
            opts,
        };
        paginate::collect(&pages, opts.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE), opts.max_records).await
    }
}
