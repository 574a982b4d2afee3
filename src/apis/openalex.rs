use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::http::{Http, USER_AGENT};
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::AuthorName;
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://api.openalex.org/works";
const DEFAULT_PAGE_SIZE: usize = 25;
const MAX_PAGE_SIZE: usize = 200;
const TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAlexClient {
    http: Http,
    base_url: String,
    email: Option<String>,
    oa_only: bool,
}

impl OpenAlexClient {
    pub fn new(ctx: &SourceContext, email: Option<String>, oa_only: bool) -> Result<Self, SourceError> {
        let ua = match email {
            Some(ref e) => format!("{} (mailto:{})", USER_AGENT, e),
            None => USER_AGENT.to_string(),
        };
        let builder = reqwest::Client::builder().user_agent(ua).timeout(TIMEOUT);
        Ok(Self {
            http: Http::build(Source::OpenAlex, builder, ctx)?,
            base_url: BASE_URL.to_string(),
            email,
            oa_only,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct OAResponse {
    meta: Option<OAMeta>,
    #[serde(default)]
    results: Vec<OAWork>,
}

#[derive(Deserialize)]
struct OAMeta {
    count: Option<usize>,
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct OAWork {
    id: Option<String>,
    display_name: Option<String>,
    authorships: Option<Vec<OAAuthorship>>,
    publication_year: Option<i32>,
    publication_date: Option<String>,
    doi: Option<String>,
    language: Option<String>,
    primary_location: Option<OALocation>,
    best_oa_location: Option<OALocation>,
    #[serde(rename = "type")]
    kind: Option<String>,
    type_crossref: Option<String>,
    indexed_in: Option<Vec<String>>,
    open_access: Option<OAOpenAccess>,
    cited_by_count: Option<u64>,
    abstract_inverted_index: Option<HashMap<String, Vec<usize>>>,
}

#[derive(Deserialize)]
struct OAAuthorship {
    author: OAAuthor,
}
#[derive(Deserialize)]
struct OAAuthor {
    display_name: Option<String>,
}
#[derive(Deserialize)]
struct OALocation {
    is_accepted: Option<bool>,
    is_published: Option<bool>,
    pdf_url: Option<String>,
    source: Option<OAVenue>,
}
#[derive(Deserialize)]
struct OAVenue {
    display_name: Option<String>,
}
#[derive(Deserialize)]
struct OAOpenAccess {
    is_oa: Option<bool>,
    oa_status: Option<String>,
}

/// Rebuild running text from an `{word: [positions]}` index.
fn rebuild_abstract(index: &HashMap<String, Vec<usize>>) -> String {
    let mut words: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, positions)| positions.iter().map(move |p| (*p, word.as_str())))
        .collect();
    words.sort_by_key(|(pos, _)| *pos);
    words
        .into_iter()
        .map(|(_, w)| w)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Works without an abstract are skipped.
fn work_to_record(w: OAWork, query_url: &str) -> Option<CanonicalRecord> {
    let abstract_text = w
        .abstract_inverted_index
        .as_ref()
        .map(rebuild_abstract)
        .filter(|a| !a.trim().is_empty())?;

    let primary = w.primary_location.as_ref();
    let pdf_url = primary
        .and_then(|l| l.pdf_url.clone())
        .or_else(|| w.best_oa_location.as_ref().and_then(|l| l.pdf_url.clone()));
    let native_id = w
        .id
        .as_deref()
        .and_then(|id| id.rsplit('/').next())
        .map(str::to_string);

    Some(
        RecordDraft {
            native_id,
            authors: w
                .authorships
                .unwrap_or_default()
                .into_iter()
                .filter_map(|a| a.author.display_name)
                .map(AuthorName::new)
                .collect(),
            title: w.display_name,
            journal: primary
                .and_then(|l| l.source.as_ref())
                .and_then(|s| s.display_name.clone()),
            publication_year: w.publication_year,
            publication_date: w.publication_date,
            abstract_text: Some(abstract_text),
            doi: w.doi,
            language: w.language,
            is_accepted: primary.and_then(|l| l.is_accepted),
            is_published: primary.and_then(|l| l.is_published),
            type_label: w.kind,
            type_crossref: w.type_crossref,
            indexed_in: w.indexed_in.filter(|i| !i.is_empty()).map(|i| i.join(", ")),
            is_open_access: w.open_access.as_ref().and_then(|oa| oa.is_oa),
            oa_status: w.open_access.and_then(|oa| oa.oa_status),
            pdf_url,
            cited_by_count: w.cited_by_count,
        }
        .build(Source::OpenAlex, query_url),
    )
}

struct OpenAlexPages<'a> {
    client: &'a OpenAlexClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

impl OpenAlexPages<'_> {
    fn filter(&self) -> Option<String> {
        let mut filters = Vec::new();
        if self.client.oa_only {
            filters.push("is_oa:true".to_string());
        }
        let (from, to) = self.opts.date_range();
        if let Some(from) = from {
            filters.push(format!("from_publication_date:{}", from.format("%Y-%m-%d")));
        }
        if let Some(to) = to {
            filters.push(format!("to_publication_date:{}", to.format("%Y-%m-%d")));
        }
        (!filters.is_empty()).then(|| filters.join(","))
    }
}

#[async_trait]
impl PageFetcher for OpenAlexPages<'_> {
    fn source(&self) -> Source {
        Source::OpenAlex
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError> {
        let mut params = vec![
            ("search", self.query.to_string()),
            ("per_page", page_size.to_string()),
            ("sort", "publication_date:desc".to_string()),
        ];
        // Cursor paging from the start; numbered pages only if a token is lost.
        match cursor {
            Cursor::Offset(0) => params.push(("cursor", "*".to_string())),
            Cursor::Offset(n) => params.push(("page", (n / page_size + 1).to_string())),
            Cursor::Link(token) => params.push(("cursor", token.clone())),
        }
        if let Some(filter) = self.filter() {
            params.push(("filter", filter));
        }
        if let Some(ref email) = self.client.email {
            params.push(("mailto", email.clone()));
        }
        let url = build_url(&self.client.base_url, &params)?;
        let resp: OAResponse = self.client.http.json(self.client.http.get(url.clone())).await?;

        let (total, next) = match resp.meta {
            Some(meta) => (meta.count, meta.next_cursor),
            None => (None, None),
        };
        Ok(Page {
            raw_len: resp.results.len(),
            records: resp
                .results
                .into_iter()
                .filter_map(|w| work_to_record(w, url.as_str()))
                .collect(),
            total,
            next,
        })
    }
}

#[async_trait]
impl PaperSource for OpenAlexClient {
    fn source(&self) -> Source {
        Source::OpenAlex
    }

    #[tracing::instrument(skip(self, opts), fields(source = "openalex"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = OpenAlexPages {
            client: self,
            query,
            opts,
        };
        paginate::collect(&pages, opts.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE), opts.max_records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use mockito::Matcher;
    use serde_json::json;

    fn work(id: &str, with_abstract: bool) -> serde_json::Value {
        let mut w = json!({
            "id": format!("https://openalex.org/{}", id),
            "display_name": format!("Work {}", id),
            "doi": format!("https://doi.org/10.1/{}", id.to_lowercase()),
            "publication_year": 2022,
            "publication_date": "2022-07-01",
            "language": "en",
            "authorships": [{"author": {"display_name": "Ada Lovelace"}}],
            "primary_location": {
                "is_accepted": true,
                "is_published": true,
                "pdf_url": null,
                "source": {"display_name": "Annals"}
            },
            "best_oa_location": {"pdf_url": format!("https://oa.example/{}.pdf", id)},
            "type": "article",
            "type_crossref": "journal-article",
            "indexed_in": ["crossref", "pubmed"],
            "open_access": {"is_oa": true, "oa_status": "gold"},
            "cited_by_count": 5
        });
        if with_abstract {
            w["abstract_inverted_index"] = json!({"Deep": [0], "learning": [1, 3], "rocks": [2]});
        }
        w
    }

    fn client(server: &mockito::Server) -> OpenAlexClient {
        let ctx = SourceContext {
            retry: RetryPolicy::without_delay(1),
            cache: None,
        };
        OpenAlexClient::new(&ctx, Some("me@example.org".into()), true)
            .unwrap()
            .with_base_url(format!("{}/works", server.url()))
    }

    #[test]
    fn test_rebuild_abstract() {
        let index: HashMap<String, Vec<usize>> =
            serde_json::from_value(json!({"Deep": [0], "learning": [1, 3], "rocks": [2]})).unwrap();
        assert_eq!(rebuild_abstract(&index), "Deep learning rocks learning");
    }

    #[test]
    fn test_work_mapping() {
        let w: OAWork = serde_json::from_value(work("W1", true)).unwrap();
        let rec = work_to_record(w, "q").unwrap();
        assert_eq!(rec.id(), "10.1/w1");
        assert_eq!(rec.doi(), "10.1/w1");
        assert_eq!(rec.journal(), "Annals");
        assert_eq!(rec.authors_year(), "Lovelace 2022");
        assert_eq!(rec.is_accepted(), "Yes");
        assert_eq!(rec.indexed_in(), "crossref, pubmed");
        assert_eq!(rec.is_open_access(), "Yes");
        assert_eq!(rec.oa_status(), "gold");
        assert_eq!(rec.download_url(), "https://oa.example/W1.pdf");
    }

    #[test]
    fn test_work_without_abstract_skipped() {
        let w: OAWork = serde_json::from_value(work("W2", false)).unwrap();
        assert!(work_to_record(w, "q").is_none());
    }

    #[tokio::test]
    async fn test_cursor_pagination() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/works")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("cursor".into(), "*".into()),
                Matcher::UrlEncoded("filter".into(), "is_oa:true".into()),
                Matcher::UrlEncoded("mailto".into(), "me@example.org".into()),
            ]))
            .with_body(
                json!({
                    "meta": {"count": 3, "next_cursor": "abc"},
                    "results": [work("W1", true), work("W2", false)]
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/works")
            .match_query(Matcher::UrlEncoded("cursor".into(), "abc".into()))
            .with_body(
                json!({
                    "meta": {"count": 3, "next_cursor": null},
                    "results": [work("W3", true)]
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let records = client(&server)
            .fetch("deep learning", &FetchOptions::with_limit(2))
            .await
            .unwrap();
        first.assert_async().await;
        second.assert_async().await;
        let ids: Vec<_> = records.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["10.1/w1", "10.1/w3"]);
    }
}
