use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::http::Http;
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://api.plos.org/search";
const DEFAULT_PAGE_SIZE: usize = 25;
const MAX_PAGE_SIZE: usize = 100;
const TIMEOUT: Duration = Duration::from_secs(30);
const FIELDS: &str = "id,title_display,journal,publication_date,article_type,author_display,abstract";

pub struct PlosClient {
    http: Http,
    base_url: String,
}

impl PlosClient {
    pub fn new(ctx: &SourceContext) -> Result<Self, SourceError> {
        Ok(Self {
            http: Http::new(Source::Plos, TIMEOUT, ctx)?,
            base_url: BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct PlosResponse {
    response: PlosResult,
}
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlosResult {
    num_found: Option<usize>,
    #[serde(default)]
    docs: Vec<PlosDoc>,
}
#[derive(Deserialize)]
struct PlosDoc {
    id: Option<String>,
    title_display: Option<String>,
    journal: Option<String>,
    publication_date: Option<String>,
    article_type: Option<String>,
    author_display: Option<Vec<String>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<TextField>,
}

/// Solr returns multi-valued text fields as arrays.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextField {
    One(String),
    Many(Vec<String>),
}

impl TextField {
    fn joined(self) -> String {
        match self {
            TextField::One(s) => s,
            TextField::Many(parts) => parts.join(" "),
        }
    }
}

fn doc_to_record(doc: PlosDoc, query_url: &str) -> CanonicalRecord {
    let date = doc
        .publication_date
        .as_deref()
        .and_then(|d| d.split('T').next())
        .map(str::to_string);
    RecordDraft {
        // PLOS ids are DOIs.
        native_id: doc.id.clone(),
        doi: doc.id,
        authors: doc
            .author_display
            .unwrap_or_default()
            .into_iter()
            .map(AuthorName::new)
            .collect(),
        title: doc.title_display.as_deref().map(normalize::strip_markup),
        journal: doc.journal,
        publication_date: date,
        abstract_text: doc
            .abstract_text
            .map(|a| normalize::clean_abstract(&a.joined())),
        is_published: Some(true),
        type_label: doc.article_type.clone(),
        type_crossref: doc.article_type,
        is_open_access: Some(true),
        oa_status: Some("PLOS Open Access".to_string()),
        ..Default::default()
    }
    .build(Source::Plos, query_url)
}

struct PlosPages<'a> {
    client: &'a PlosClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

impl PlosPages<'_> {
    fn date_filter(&self) -> Option<String> {
        let (from, to) = self.opts.date_range();
        if from.is_none() && to.is_none() {
            return None;
        }
        let from = from.map_or("*".to_string(), |d| format!("{}T00:00:00Z", d.format("%Y-%m-%d")));
        let to = to.map_or("*".to_string(), |d| format!("{}T23:59:59Z", d.format("%Y-%m-%d")));
        Some(format!("publication_date:[{} TO {}]", from, to))
    }
}

#[async_trait]
impl PageFetcher for PlosPages<'_> {
    fn source(&self) -> Source {
        Source::Plos
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError> {
        let start = cursor
            .offset()
            .ok_or_else(|| SourceError::Api("PLOS pages by offset only".to_string()))?;
        let mut params = vec![
            ("q", self.query.to_string()),
            ("rows", page_size.to_string()),
            ("start", start.to_string()),
            ("fl", FIELDS.to_string()),
            ("wt", "json".to_string()),
        ];
        if let Some(fq) = self.date_filter() {
            params.push(("fq", fq));
        }
        let url = build_url(&self.client.base_url, &params)?;
        let resp: PlosResponse = self.client.http.json(self.client.http.get(url.clone())).await?;

        let docs = resp.response.docs;
        Ok(Page {
            raw_len: docs.len(),
            records: docs
                .into_iter()
                .map(|d| doc_to_record(d, url.as_str()))
                .collect(),
            total: resp.response.num_found,
            next: None,
        })
    }
}

#[async_trait]
impl PaperSource for PlosClient {
    fn source(&self) -> Source {
        Source::Plos
    }

    #[tracing::instrument(skip(self, opts), fields(source = "plos"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = PlosPages {
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

    fn doc(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "title_display": "Malaria <i>in vivo</i> study",
            "journal": "PLOS ONE",
            "publication_date": "2019-04-10T00:00:00Z",
            "article_type": "Research Article",
            "author_display": ["Ana Silva", "Bruno Costa", "Carla Dias"],
            "abstract": ["\nBackground text.  ", "More."]
        })
    }

    #[test]
    fn test_doc_mapping() {
        let d: PlosDoc = serde_json::from_value(doc("10.1371/journal.pone.0001")).unwrap();
        let rec = doc_to_record(d, "q");
        assert_eq!(rec.id(), "10.1371/journal.pone.0001");
        assert_eq!(rec.doi(), "10.1371/journal.pone.0001");
        assert_eq!(rec.title(), "Malaria in vivo study");
        assert_eq!(rec.publication_date(), "2019-04-10");
        assert_eq!(rec.publication_year(), "2019");
        assert_eq!(rec.authors_year(), "Silva et al. 2019");
        assert_eq!(rec.abstract_text(), "Background text. More.");
        assert_eq!(rec.oa_status(), "PLOS Open Access");
        assert_eq!(rec.download_url(), "https://doi.org/10.1371/journal.pone.0001");
    }

    #[tokio::test]
    async fn test_fetch_with_date_filter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "malaria".into()),
                Matcher::UrlEncoded("start".into(), "0".into()),
                Matcher::UrlEncoded(
                    "fq".into(),
                    "publication_date:[2018-01-01T00:00:00Z TO *]".into(),
                ),
            ]))
            .with_body(json!({"response": {"numFound": 2, "docs": [doc("10.1/a"), doc("10.1/b")]}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let ctx = SourceContext {
            retry: RetryPolicy::without_delay(1),
            cache: None,
        };
        let client = PlosClient::new(&ctx)
            .unwrap()
            .with_base_url(format!("{}/search", server.url()));
        let opts = FetchOptions {
            start_year: Some(2018),
            ..Default::default()
        };
        let records = client.fetch("malaria", &opts).await.unwrap();
        mock.assert_async().await;
        assert_eq!(records.len(), 2);
    }
}
