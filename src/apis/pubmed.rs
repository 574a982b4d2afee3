//! PubMed E-utilities client.
//!
//! Two phases: `esearch` collects PMIDs (JSON), `efetch` pulls article
//! metadata for batches of PMIDs (XML).

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::http::{pause, Http};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
/// Largest `retmax` a single esearch call accepts.
const ESEARCH_STEP: usize = 10_000;
const EFETCH_BATCH: usize = 200;
const TIMEOUT: Duration = Duration::from_secs(30);
/// NCBI allows 3 requests/s without a key, 10 with one.
const DELAY_ANONYMOUS: Duration = Duration::from_millis(340);
const DELAY_WITH_KEY: Duration = Duration::from_millis(100);

const PUBLISHED_STATUSES: [&str; 4] = ["epublish", "ppublish", "pubmed", "medline"];

pub struct PubMedClient {
    http: Http,
    base_url: String,
    api_key: Option<String>,
    email: Option<String>,
    tool: String,
    request_delay: Duration,
}

impl PubMedClient {
    pub fn new(
        ctx: &SourceContext,
        api_key: Option<String>,
        email: Option<String>,
        tool: String,
    ) -> Result<Self, SourceError> {
        let request_delay = if api_key.is_some() {
            DELAY_WITH_KEY
        } else {
            DELAY_ANONYMOUS
        };
        Ok(Self {
            http: Http::new(Source::PubMed, TIMEOUT, ctx)?,
            base_url: BASE_URL.to_string(),
            api_key,
            email,
            tool,
            request_delay,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string()), ("tool", self.tool.clone())];
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    fn date_params(opts: &FetchOptions) -> Vec<(&'static str, String)> {
        let (from, to) = opts.date_range();
        if from.is_none() && to.is_none() {
            return Vec::new();
        }
        // Both bounds are required once a date type is given.
        let min = from.map_or("1800/01/01".to_string(), |d| d.format("%Y/%m/%d").to_string());
        let max = to.map_or("3000/12/31".to_string(), |d| d.format("%Y/%m/%d").to_string());
        vec![
            ("datetype", "pdat".to_string()),
            ("mindate", min),
            ("maxdate", max),
        ]
    }

    async fn esearch(
        &self,
        query: &str,
        opts: &FetchOptions,
        retmax: usize,
        retstart: usize,
    ) -> Result<ESearchResult, SourceError> {
        let mut params = self.base_params();
        params.extend([
            ("term", query.to_string()),
            ("retmode", "json".to_string()),
            ("retmax", retmax.to_string()),
            ("retstart", retstart.to_string()),
        ]);
        params.extend(Self::date_params(opts));
        let url = build_url(&format!("{}/esearch.fcgi", self.base_url), &params)?;
        let resp: ESearchResponse = self.http.json(self.http.get(url)).await?;
        if let Some(err) = &resp.esearchresult.error {
            return Err(SourceError::Api(format!("PubMed esearch: {}", err)));
        }
        Ok(resp.esearchresult)
    }

    /// PMIDs for the query, honouring the record limit.
    #[instrument(skip(self, opts))]
    async fn collect_ids(&self, query: &str, opts: &FetchOptions) -> Result<Vec<String>, SourceError> {
        if let Some(limit) = opts.max_records.filter(|l| *l <= ESEARCH_STEP) {
            return Ok(self.esearch(query, opts, limit, 0).await?.idlist);
        }

        let total = self.esearch(query, opts, 0, 0).await?.count();
        let target = opts.max_records.map_or(total, |l| l.min(total));
        info!(total, target, "collecting PubMed ids");

        let mut ids = Vec::with_capacity(target);
        let mut start = 0;
        while start < target {
            pause(self.request_delay).await;
            let step = ESEARCH_STEP.min(target - start);
            let batch = self.esearch(query, opts, step, start).await?.idlist;
            if batch.is_empty() {
                break;
            }
            let short = batch.len() < step;
            ids.extend(batch);
            start += step;
            if short {
                break;
            }
        }
        ids.truncate(target);
        Ok(ids)
    }

    #[instrument(skip(self, pmids), fields(count = pmids.len()))]
    async fn efetch(&self, pmids: &[String]) -> Result<Vec<CanonicalRecord>, SourceError> {
        let mut params = self.base_params();
        params.push(("id", pmids.join(",")));
        params.push(("retmode", "xml".to_string()));
        let url = build_url(&format!("{}/efetch.fcgi", self.base_url), &params)?;
        let xml = self.http.text(self.http.get(url.clone())).await?;
        parse_efetch(&xml, url.as_str())
    }
}

#[async_trait]
impl PaperSource for PubMedClient {
    fn source(&self) -> Source {
        Source::PubMed
    }

    #[instrument(skip(self, opts), fields(source = "pubmed"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        if opts.max_records == Some(0) {
            return Ok(Vec::new());
        }
        let ids = self.collect_ids(query, opts).await?;
        debug!(ids = ids.len(), "PubMed esearch done");

        let mut records = Vec::with_capacity(ids.len());
        for batch in ids.chunks(EFETCH_BATCH) {
            pause(self.request_delay).await;
            records.extend(self.efetch(batch).await?);
        }
        if let Some(limit) = opts.max_records {
            records.truncate(limit);
        }
        info!(count = records.len(), "retrieval finished");
        Ok(records)
    }
}

#[derive(Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Deserialize)]
struct ESearchResult {
    count: Option<String>,
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

impl ESearchResult {
    fn count(&self) -> usize {
        self.count
            .as_deref()
            .and_then(|c| c.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Minimal element tree; PubMed records nest deeply and carry mixed content
/// (inline markup inside titles and abstracts).
#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    nodes: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Text(String),
    Child(Element),
}

impl Element {
    fn open(e: &BytesStart) -> Self {
        Self {
            name: String::from_utf8_lossy(e.name().as_ref()).to_string(),
            attrs: e
                .attributes()
                .flatten()
                .map(|a| {
                    (
                        String::from_utf8_lossy(a.key.as_ref()).to_string(),
                        String::from_utf8_lossy(&a.value).to_string(),
                    )
                })
                .collect(),
            nodes: Vec::new(),
        }
    }

    fn children(&self) -> impl Iterator<Item = &Element> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Child(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children().filter(move |e| e.name == name)
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children().find(|e| e.name == name)
    }

    fn path(&self, names: &[&str]) -> Option<&Element> {
        names.iter().try_fold(self, |el, name| el.child(name))
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All descendant text, whitespace-collapsed.
    fn text(&self) -> String {
        fn gather(el: &Element, out: &mut String) {
            for node in &el.nodes {
                match node {
                    Node::Text(t) => out.push_str(t),
                    Node::Child(c) => gather(c, out),
                }
            }
        }
        let mut out = String::new();
        gather(self, &mut out);
        normalize::collapse_whitespace(&out)
    }

    fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text).filter(|t| !t.is_empty())
    }
}

fn parse_tree(xml: &str) -> Result<Element, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut stack = vec![Element::default()];
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(Element::open(&e)),
            Ok(Event::Empty(e)) => {
                if let Some(parent) = stack.last_mut() {
                    parent.nodes.push(Node::Child(Element::open(&e)));
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    return Err(SourceError::Parse("unbalanced PubMed XML".to_string()));
                }
                if let (Some(done), Some(parent)) = (stack.pop(), stack.last_mut()) {
                    parent.nodes.push(Node::Child(done));
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map(|t| t.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&e).to_string());
                if let Some(top) = stack.last_mut() {
                    top.nodes.push(Node::Text(text));
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(top) = stack.last_mut() {
                    top.nodes.push(Node::Text(String::from_utf8_lossy(&e).to_string()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    match stack.pop() {
        Some(root) if stack.is_empty() => Ok(root),
        _ => Err(SourceError::Parse("truncated PubMed XML".to_string())),
    }
}

fn parse_efetch(xml: &str, query_url: &str) -> Result<Vec<CanonicalRecord>, SourceError> {
    let root = parse_tree(xml)?;
    let set = root
        .child("PubmedArticleSet")
        .ok_or_else(|| SourceError::Parse("efetch response has no PubmedArticleSet".to_string()))?;
    Ok(set
        .children_named("PubmedArticle")
        .map(|a| article_to_record(a, query_url))
        .collect())
}

fn article_to_record(article: &Element, query_url: &str) -> CanonicalRecord {
    let citation = article.child("MedlineCitation");
    let art = citation.and_then(|c| c.child("Article"));
    let pubdate = art.and_then(|a| a.path(&["Journal", "JournalIssue", "PubDate"]));

    let year = pubdate.and_then(|p| {
        p.child_text("Year")
            .or_else(|| p.child_text("MedlineDate").and_then(|m| normalize::leading_year(&m)))
    });
    let date = pubdate.and_then(|p| {
        normalize::partial_date(
            year.as_deref(),
            p.child_text("Month").as_deref(),
            p.child_text("Day").as_deref(),
        )
    });

    let authors = art
        .and_then(|a| a.child("AuthorList"))
        .map(|list| list.children_named("Author").filter_map(author_name).collect())
        .unwrap_or_default();

    let abstract_text = art.and_then(|a| a.child("Abstract")).map(|abs| {
        abs.children_named("AbstractText")
            .map(Element::text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    });

    let id_of = |kind: &str| {
        article
            .path(&["PubmedData", "ArticleIdList"])
            .and_then(|list| {
                list.children_named("ArticleId")
                    .find(|id| id.attr("IdType").is_some_and(|t| t.eq_ignore_ascii_case(kind)))
            })
            .map(Element::text)
            .filter(|t| !t.is_empty())
    };
    let doi = id_of("doi").or_else(|| {
        art.and_then(|a| {
            a.children_named("ELocationID")
                .find(|e| e.attr("EIdType") == Some("doi"))
                .map(Element::text)
        })
    });
    let pmc = id_of("pmc").map(|p| {
        if p.starts_with("PMC") {
            p
        } else {
            format!("PMC{}", p)
        }
    });
    let status = article
        .path(&["PubmedData", "PublicationStatus"])
        .map(Element::text)
        .map(|s| s.to_lowercase());

    RecordDraft {
        native_id: citation.and_then(|c| c.child_text("PMID")),
        authors,
        title: art.and_then(|a| a.child_text("ArticleTitle")),
        journal: art.and_then(|a| a.path(&["Journal", "Title"])).map(Element::text),
        publication_year: year.as_deref().and_then(|y| y.parse().ok()),
        publication_date: date,
        abstract_text,
        doi,
        language: art.and_then(|a| a.child_text("Language")),
        is_published: status.map(|s| PUBLISHED_STATUSES.contains(&s.as_str())),
        type_label: art
            .and_then(|a| a.child("PublicationTypeList"))
            .and_then(|l| l.child_text("PublicationType")),
        is_open_access: pmc.is_some().then_some(true),
        oa_status: pmc.as_ref().map(|_| "PMC - Possibly OA".to_string()),
        pdf_url: pmc.map(|p| format!("https://www.ncbi.nlm.nih.gov/pmc/articles/{}/pdf/", p)),
        ..Default::default()
    }
    .build(Source::PubMed, query_url)
}

fn author_name(author: &Element) -> Option<AuthorName> {
    if let Some(last) = author.child_text("LastName") {
        let given = author
            .child_text("ForeName")
            .or_else(|| author.child_text("Initials"));
        return Some(AuthorName::structured(given.as_deref(), Some(&last)));
    }
    author.child_text("CollectiveName").map(AuthorName::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use mockito::Matcher;
    use serde_json::json;

    const SAMPLE_EFETCH: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE PubmedArticleSet PUBLIC "-//NLM//DTD PubMedArticle, 1st January 2024//EN" "https://dtd.nlm.nih.gov/ncbi/pubmed/out/pubmed_240101.dtd">
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">12345678</PMID>
      <Article PubModel="Print">
        <Journal>
          <Title>Journal of Lung Research</Title>
          <JournalIssue CitedMedium="Internet">
            <PubDate><Year>2021</Year><Month>Mar</Month><Day>5</Day></PubDate>
          </JournalIssue>
        </Journal>
        <ArticleTitle>Fibrosis <i>segmentation</i> with CNNs.</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">Lungs &amp; more.</AbstractText>
          <AbstractText Label="RESULTS">It works.</AbstractText>
        </Abstract>
        <AuthorList>
          <Author><LastName>Doe</LastName><ForeName>Jane</ForeName></Author>
          <Author><LastName>Roe</LastName><Initials>R</Initials></Author>
        </AuthorList>
        <Language>eng</Language>
        <PublicationTypeList><PublicationType UI="D016428">Journal Article</PublicationType></PublicationTypeList>
      </Article>
    </MedlineCitation>
    <PubmedData>
      <PublicationStatus>ppublish</PublicationStatus>
      <ArticleIdList>
        <ArticleId IdType="pubmed">12345678</ArticleId>
        <ArticleId IdType="doi">10.1000/lung.1</ArticleId>
        <ArticleId IdType="pmc">PMC999</ArticleId>
      </ArticleIdList>
      <ReferenceList>
        <Reference><ArticleIdList><ArticleId IdType="doi">10.9/other</ArticleId></ArticleIdList></Reference>
      </ReferenceList>
    </PubmedData>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>222</PMID>
      <Article>
        <Journal><JournalIssue><PubDate><MedlineDate>2019 Nov-Dec</MedlineDate></PubDate></JournalIssue></Journal>
        <ArticleTitle>Collective work</ArticleTitle>
        <AuthorList><Author><CollectiveName>Lung Study Group</CollectiveName></Author></AuthorList>
      </Article>
    </MedlineCitation>
    <PubmedData><PublicationStatus>aheadofprint</PublicationStatus></PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

    fn client(server: &mockito::Server) -> PubMedClient {
        let ctx = SourceContext {
            retry: RetryPolicy::without_delay(1),
            cache: None,
        };
        PubMedClient::new(&ctx, None, Some("me@example.org".into()), "review-search".into())
            .unwrap()
            .with_base_url(server.url())
            .with_request_delay(Duration::ZERO)
    }

    #[test]
    fn test_parse_efetch() {
        let records = parse_efetch(SAMPLE_EFETCH, "q").unwrap();
        assert_eq!(records.len(), 2);

        let r = &records[0];
        assert_eq!(r.id(), "10.1000/lung.1");
        assert_eq!(r.title(), "Fibrosis segmentation with CNNs.");
        assert_eq!(r.journal(), "Journal of Lung Research");
        assert_eq!(r.publication_date(), "2021-03-05");
        assert_eq!(r.authors(), "Jane Doe, R Roe");
        assert_eq!(r.authors_year(), "Doe and Roe 2021");
        assert_eq!(r.abstract_text(), "Lungs & more. It works.");
        assert_eq!(r.is_published(), "Yes");
        assert_eq!(r.is_open_access(), "Yes");
        assert_eq!(r.download_url(), "https://www.ncbi.nlm.nih.gov/pmc/articles/PMC999/pdf/");
        assert_eq!(r.type_label(), "Journal Article");
        assert_eq!(r.type_crossref(), "N/A");
        assert_eq!(r.cited_by_count(), "N/A");

        let r = &records[1];
        assert_eq!(r.id(), "222");
        assert_eq!(r.publication_year(), "2019");
        assert_eq!(r.publication_date(), "2019");
        assert_eq!(r.authors(), "Lung Study Group");
        assert_eq!(r.authors_year(), "Group 2019");
        assert_eq!(r.is_published(), "No");
        assert_eq!(r.is_open_access(), "N/A");
        assert_eq!(r.download_url(), "N/A");
        assert_eq!(r.type_label(), "N/A");
    }

    #[test]
    fn test_element_lookup_by_path() {
        let root = parse_tree(SAMPLE_EFETCH).unwrap();
        let set = root.child("PubmedArticleSet").unwrap();
        let article = set.child("PubmedArticle").unwrap();
        let title = article.path(&["MedlineCitation", "Article", "Journal", "Title"]).unwrap();
        assert_eq!(title.text(), "Journal of Lung Research");
        assert_eq!(
            article.path(&["PubmedData", "PublicationStatus"]).map(Element::text).as_deref(),
            Some("ppublish")
        );
        assert!(article.path(&["MedlineCitation", "Nope"]).is_none());
        assert_eq!(set.children_named("PubmedArticle").count(), 2);
        assert!(root.path(&["PubmedArticleSet", "PubmedArticle", "PubmedData", "ArticleIdList"]).is_some());
    }

    #[test]
    fn test_missing_article_set_is_parse_error() {
        assert!(matches!(parse_efetch("<eFetchResult/>", "q"), Err(SourceError::Parse(_))));
        assert!(matches!(parse_efetch("<PubmedArticleSet><Bad>", "q"), Err(SourceError::Parse(_))));
    }

    #[tokio::test]
    async fn test_fetch_with_limit_uses_single_esearch() {
        let mut server = mockito::Server::new_async().await;
        let search = server
            .mock("GET", "/esearch.fcgi")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("term".into(), "lung fibrosis".into()),
                Matcher::UrlEncoded("retmax".into(), "2".into()),
                Matcher::UrlEncoded("datetype".into(), "pdat".into()),
                Matcher::UrlEncoded("mindate".into(), "2020/01/01".into()),
                Matcher::UrlEncoded("maxdate".into(), "3000/12/31".into()),
                Matcher::UrlEncoded("email".into(), "me@example.org".into()),
            ]))
            .with_body(json!({"esearchresult": {"count": "57", "idlist": ["12345678", "222"]}}).to_string())
            .expect(1)
            .create_async()
            .await;
        let fetch = server
            .mock("GET", "/efetch.fcgi")
            .match_query(Matcher::UrlEncoded("id".into(), "12345678,222".into()))
            .with_body(SAMPLE_EFETCH)
            .expect(1)
            .create_async()
            .await;

        let opts = FetchOptions {
            max_records: Some(2),
            start_year: Some(2020),
            ..Default::default()
        };
        let records = client(&server).fetch("lung fibrosis", &opts).await.unwrap();
        search.assert_async().await;
        fetch.assert_async().await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_all_counts_then_pages() {
        let mut server = mockito::Server::new_async().await;
        let count = server
            .mock("GET", "/esearch.fcgi")
            .match_query(Matcher::UrlEncoded("retmax".into(), "0".into()))
            .with_body(json!({"esearchresult": {"count": "2", "idlist": []}}).to_string())
            .expect(1)
            .create_async()
            .await;
        let ids = server
            .mock("GET", "/esearch.fcgi")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("retmax".into(), "2".into()),
                Matcher::UrlEncoded("retstart".into(), "0".into()),
            ]))
            .with_body(json!({"esearchresult": {"count": "2", "idlist": ["12345678", "222"]}}).to_string())
            .expect(1)
            .create_async()
            .await;
        let fetch = server
            .mock("GET", "/efetch.fcgi")
            .match_query(Matcher::Any)
            .with_body(SAMPLE_EFETCH)
            .expect(1)
            .create_async()
            .await;

        let records = client(&server).fetch("q", &FetchOptions::default()).await.unwrap();
        count.assert_async().await;
        ids.assert_async().await;
        fetch.assert_async().await;
        assert_eq!(records.len(), 2);
    }
}
