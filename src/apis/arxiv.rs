use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::http::Http;
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://export.arxiv.org/api/query";
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 200;
// Respect rate limit: 1 req / 3s
const PAGE_DELAY: Duration = Duration::from_secs(3);
const TIMEOUT: Duration = Duration::from_secs(60);

pub struct ArxivClient {
    http: Http,
    base_url: String,
    page_delay: Duration,
}

impl ArxivClient {
    pub fn new(ctx: &SourceContext) -> Result<Self, SourceError> {
        Ok(Self {
            http: Http::new(Source::Arxiv, TIMEOUT, ctx)?,
            base_url: BASE_URL.to_string(),
            page_delay: PAGE_DELAY,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }
}

struct ArxivPages<'a> {
    client: &'a ArxivClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

#[async_trait]
impl PageFetcher for ArxivPages<'_> {
    fn source(&self) -> Source {
        Source::Arxiv
    }

    fn page_delay(&self) -> Duration {
        self.client.page_delay
    }

    async fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, SourceError> {
        let start = cursor
            .offset()
            .ok_or_else(|| SourceError::Api("arXiv pages by offset only".to_string()))?;
        let url = build_url(
            &self.client.base_url,
            &[
                ("search_query", self.query.to_string()),
                ("start", start.to_string()),
                ("max_results", page_size.to_string()),
                ("sortBy", "relevance".to_string()),
                ("sortOrder", "descending".to_string()),
            ],
        )?;
        let body = self.client.http.text(self.client.http.get(url.clone())).await?;
        let feed = parse_atom_feed(&body)?;

        // The API has no date filter; filter on the published year.
        let raw_len = feed.entries.len();
        let records = feed
            .entries
            .into_iter()
            .filter(|e| self.opts.accepts_year(e.year()))
            .map(|e| e.into_record(url.as_str()))
            .collect();
        Ok(Page {
            records,
            raw_len,
            total: feed.total,
            next: None,
        })
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    fn source(&self) -> Source {
        Source::Arxiv
    }

    #[tracing::instrument(skip(self, opts), fields(source = "arxiv"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = ArxivPages {
            client: self,
            query,
            opts,
        };
        paginate::collect(&pages, opts.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE), opts.max_records).await
    }
}

#[derive(Debug, Default)]
struct AtomFeed {
    total: Option<usize>,
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Default)]
struct AtomEntry {
    id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    doi: Option<String>,
    journal_ref: Option<String>,
    pdf_url: Option<String>,
}

impl AtomEntry {
    fn year(&self) -> Option<i32> {
        normalize::year_of(&self.published)
    }

    fn take_link(&mut self, e: &BytesStart) {
        let mut href = String::new();
        let mut is_pdf = false;
        for attr in e.attributes().flatten() {
            let val = String::from_utf8_lossy(&attr.value).to_string();
            match attr.key.as_ref() {
                b"href" => href = val,
                b"title" if val == "pdf" => is_pdf = true,
                b"type" if val == "application/pdf" => is_pdf = true,
                _ => {}
            }
        }
        if is_pdf && !href.is_empty() {
            self.pdf_url = Some(href);
        }
    }

    fn into_record(self, query_url: &str) -> CanonicalRecord {
        let date = self
            .published
            .trim()
            .split('T')
            .next()
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        let has_journal_ref = self
            .journal_ref
            .as_deref()
            .is_some_and(|j| !j.trim().is_empty());
        RecordDraft {
            publication_year: self.year(),
            native_id: Some(self.id),
            authors: self.authors.into_iter().map(AuthorName::new).collect(),
            title: Some(self.title),
            journal: self.journal_ref,
            publication_date: date,
            abstract_text: Some(self.summary),
            doi: self.doi,
            is_published: Some(has_journal_ref),
            type_label: Some("arXiv".to_string()),
            is_open_access: Some(true),
            oa_status: Some("Open Access".to_string()),
            pdf_url: self.pdf_url,
            ..Default::default()
        }
        .build(Source::Arxiv, query_url)
    }
}

fn parse_atom_feed(xml: &str) -> Result<AtomFeed, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut feed = AtomFeed::default();
    let mut entry: Option<AtomEntry> = None;
    let mut current_tag = String::new();
    let mut author_name = String::new();
    let mut in_author = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "entry" => entry = Some(AtomEntry::default()),
                    "author" => {
                        in_author = true;
                        author_name.clear();
                    }
                    "link" => {
                        if let Some(ent) = entry.as_mut() {
                            ent.take_link(&e);
                        }
                    }
                    _ => {}
                }
                current_tag = tag;
            }
            Ok(Event::Empty(e)) => {
                if let Some(ent) = entry.as_mut() {
                    if e.name().as_ref() == b"link" {
                        ent.take_link(&e);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default();
                match (entry.as_mut(), current_tag.as_str()) {
                    (None, "opensearch:totalResults") => feed.total = text.trim().parse().ok(),
                    (Some(_), "name") if in_author => author_name.push_str(&text),
                    (Some(ent), "id") => ent.id.push_str(text.trim()),
                    (Some(ent), "title") => ent.title.push_str(&text),
                    (Some(ent), "summary") => ent.summary.push_str(&text),
                    (Some(ent), "published") => ent.published.push_str(text.trim()),
                    (Some(ent), "arxiv:doi") => {
                        ent.doi.get_or_insert_with(String::new).push_str(text.trim())
                    }
                    (Some(ent), "arxiv:journal_ref") => {
                        ent.journal_ref.get_or_insert_with(String::new).push_str(&text)
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "entry" => {
                        if let Some(ent) = entry.take() {
                            // Malformed queries come back as a single error entry.
                            if ent.id.contains("/api/errors") {
                                return Err(SourceError::Api(format!(
                                    "arXiv rejected the query: {}",
                                    normalize::collapse_whitespace(&ent.summary)
                                )));
                            }
                            feed.entries.push(ent);
                        }
                    }
                    "author" if in_author => {
                        in_author = false;
                        let name = author_name.trim();
                        if let (Some(ent), false) = (entry.as_mut(), name.is_empty()) {
                            ent.authors.push(name.to_string());
                        }
                    }
                    _ => {}
                }
                if tag == current_tag {
                    current_tag.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(feed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use mockito::Matcher;

    const SAMPLE_ATOM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom"
      xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">
  <opensearch:totalResults>2</opensearch:totalResults>
  <entry>
    <id>http://arxiv.org/abs/2301.12345v1</id>
    <title>Test Paper on
      AdS/CFT</title>
    <summary>This is a test abstract about AdS/CFT correspondence.</summary>
    <published>2023-01-15T00:00:00Z</published>
    <author><name>John Doe</name></author>
    <author><name>Jane Smith</name></author>
    <arxiv:doi>10.1000/adscft</arxiv:doi>
    <arxiv:journal_ref>Phys. Rev. D 1 (2023)</arxiv:journal_ref>
    <link href="http://arxiv.org/abs/2301.12345v1" rel="alternate" type="text/html"/>
    <link href="http://arxiv.org/pdf/2301.12345v1" title="pdf" type="application/pdf"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/1801.00001v2</id>
    <title>Older Preprint</title>
    <summary>Old.</summary>
    <published>2018-01-01T00:00:00Z</published>
    <author><name>Solo Author</name></author>
  </entry>
</feed>"#;

    fn client(server: &mockito::Server) -> ArxivClient {
        let ctx = SourceContext {
            retry: RetryPolicy::without_delay(1),
            cache: None,
        };
        ArxivClient::new(&ctx)
            .unwrap()
            .with_base_url(format!("{}/api/query", server.url()))
            .with_page_delay(Duration::ZERO)
    }

    #[test]
    fn test_parse_atom_feed() {
        let feed = parse_atom_feed(SAMPLE_ATOM).unwrap();
        assert_eq!(feed.total, Some(2));
        assert_eq!(feed.entries.len(), 2);

        let rec = feed.entries.into_iter().next().unwrap().into_record("q");
        assert_eq!(rec.title(), "Test Paper on AdS/CFT");
        assert_eq!(rec.authors(), "John Doe, Jane Smith");
        assert_eq!(rec.authors_year(), "Doe and Smith 2023");
        assert_eq!(rec.publication_date(), "2023-01-15");
        assert_eq!(rec.id(), "10.1000/adscft");
        assert_eq!(rec.journal(), "Phys. Rev. D 1 (2023)");
        assert_eq!(rec.is_published(), "Yes");
        assert_eq!(rec.type_label(), "arXiv");
        assert_eq!(rec.download_url(), "http://arxiv.org/pdf/2301.12345v1");
        assert_eq!(rec.indexed_in(), "arXiv");
    }

    #[test]
    fn test_entry_without_doi_uses_abs_url() {
        let feed = parse_atom_feed(SAMPLE_ATOM).unwrap();
        let rec = feed.entries.into_iter().nth(1).unwrap().into_record("q");
        assert_eq!(rec.id(), "http://arxiv.org/abs/1801.00001v2");
        assert_eq!(rec.doi(), "N/A");
        assert_eq!(rec.is_published(), "No");
        assert_eq!(rec.download_url(), "N/A");
    }

    #[test]
    fn test_error_entry_is_api_error() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry>
            <id>http://arxiv.org/api/errors#incorrect_id_format</id>
            <title>Error</title><summary>incorrect id format</summary></entry></feed>"#;
        assert!(matches!(parse_atom_feed(xml), Err(SourceError::Api(_))));
    }

    #[tokio::test]
    async fn test_fetch_filters_by_year_and_counts_raw_entries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/query")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("search_query".into(), "all:holography".into()),
                Matcher::UrlEncoded("start".into(), "0".into()),
            ]))
            .with_body(SAMPLE_ATOM)
            .expect(1)
            .create_async()
            .await;

        let opts = FetchOptions {
            start_year: Some(2020),
            ..Default::default()
        };
        let records = client(&server).fetch("all:holography", &opts).await.unwrap();
        mock.assert_async().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].publication_year(), "2023");
    }

    #[tokio::test]
    async fn test_fetch_pages_until_total() {
        let mut server = mockito::Server::new_async().await;
        let page = |start: &str, id: &str| {
            format!(
                r#"<feed xmlns="http://www.w3.org/2005/Atom" xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">
                <opensearch:totalResults>3</opensearch:totalResults>
                <entry><id>http://arxiv.org/abs/{id}</id><title>T{start}</title>
                <published>2022-02-02T00:00:00Z</published></entry></feed>"#
            )
        };
        let mut mocks = Vec::new();
        for (start, id) in [("0", "a"), ("1", "b"), ("2", "c")] {
            mocks.push(
                server
                    .mock("GET", "/api/query")
                    .match_query(Matcher::UrlEncoded("start".into(), start.into()))
                    .with_body(page(start, id))
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        let opts = FetchOptions::with_limit(10);
        let records = client(&server).fetch("q", &opts).await.unwrap();
        assert_eq!(records.len(), 3);
        for m in &mocks {
            m.assert_async().await;
        }
    }
}
