use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

use super::http::Http;
use super::paginate::{self, Cursor, Page, PageFetcher};
use super::{build_url, FetchOptions, PaperSource, SourceContext, SourceError};
use crate::normalize::{self, AuthorName};
use crate::record::{CanonicalRecord, RecordDraft, Source};

const BASE_URL: &str = "https://scholar.google.com/scholar";
/// Result pages always hold ten hits; there is no page-size parameter.
const PAGE_SIZE: usize = 10;
const TIMEOUT: Duration = Duration::from_secs(20);
const PAGE_DELAY: Duration = Duration::from_secs(2);
const BROWSER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

pub struct ScholarClient {
    http: Http,
    base_url: String,
    page_delay: Duration,
}

impl ScholarClient {
    pub fn new(ctx: &SourceContext, proxy: Option<&str>) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(BROWSER_AGENT)
            .timeout(TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: Http::build(Source::Scholar, builder, ctx)?,
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

#[derive(Debug, Default, PartialEq)]
struct ScholarHit {
    cid: Option<String>,
    title: Option<String>,
    link: Option<String>,
    authors: Vec<String>,
    venue: Option<String>,
    year: Option<i32>,
    snippet: Option<String>,
    cited_by: Option<u64>,
    pdf: Option<String>,
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("bad selector {}: {:?}", css, e)))
}

fn text_of(el: ElementRef<'_>) -> String {
    normalize::collapse_whitespace(&el.text().collect::<String>())
}

fn is_blocked(html: &str) -> bool {
    html.contains("gs_captcha_f")
        || html.contains("unusual traffic")
        || html.contains("recaptcha")
}

/// Drop leading `[PDF]`, `[HTML]`, `[BOOK]`, `[CITATION]` markers.
fn strip_title_tags(title: &str) -> String {
    let mut rest = title.trim();
    while rest.starts_with('[') {
        match rest.find(']') {
            Some(end) => rest = rest[end + 1..].trim_start(),
            None => break,
        }
    }
    rest.to_string()
}

/// Split the `gs_a` byline: "A Author, B Author - Venue, 2019 - host".
fn parse_byline(byline: &str) -> (Vec<String>, Option<String>, Option<i32>) {
    let byline = byline.replace('\u{a0}', " ");
    let mut parts = byline.split(" - ");
    let authors = parts
        .next()
        .map(|a| {
            a.split(',')
                .map(|n| n.trim().trim_end_matches('…').trim())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let Some(middle) = parts.next() else {
        return (authors, None, None);
    };
    let mut pieces: Vec<&str> = middle.split(',').map(str::trim).collect();
    let year = pieces
        .last()
        .filter(|p| p.len() == 4 && p.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|p| p.parse().ok());
    if year.is_some() {
        pieces.pop();
    }
    let venue = pieces.join(", ").trim_end_matches('…').trim().to_string();
    (authors, (!venue.is_empty()).then_some(venue), year)
}

fn parse_results(html: &str) -> Result<Vec<ScholarHit>, SourceError> {
    if is_blocked(html) {
        return Err(SourceError::Api(
            "Google Scholar refused the request (CAPTCHA / unusual traffic)".to_string(),
        ));
    }
    let doc = Html::parse_document(html);
    let result_sel = selector("div.gs_r.gs_or.gs_scl")?;
    let title_sel = selector("h3.gs_rt")?;
    let link_sel = selector("h3.gs_rt a")?;
    let byline_sel = selector("div.gs_a")?;
    let snippet_sel = selector("div.gs_rs")?;
    let footer_link_sel = selector("div.gs_fl a")?;
    let pdf_sel = selector("div.gs_or_ggsm a")?;

    let hits = doc
        .select(&result_sel)
        .map(|el| {
            let (authors, venue, year) = el
                .select(&byline_sel)
                .next()
                .map(|b| parse_byline(&text_of(b)))
                .unwrap_or_default();
            let cited_by = el
                .select(&footer_link_sel)
                .map(text_of)
                .find_map(|t| t.strip_prefix("Cited by ").and_then(|n| n.trim().parse().ok()));
            ScholarHit {
                cid: el.value().attr("data-cid").map(str::to_string),
                title: el
                    .select(&title_sel)
                    .next()
                    .map(|t| strip_title_tags(&text_of(t)))
                    .filter(|t| !t.is_empty()),
                link: el
                    .select(&link_sel)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .map(str::to_string),
                authors,
                venue,
                year,
                snippet: el.select(&snippet_sel).next().map(text_of),
                cited_by,
                pdf: el
                    .select(&pdf_sel)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .map(str::to_string),
            }
        })
        .collect();
    Ok(hits)
}

fn hit_to_record(hit: ScholarHit, query_url: &str) -> CanonicalRecord {
    RecordDraft {
        native_id: hit.cid,
        authors: hit.authors.into_iter().map(AuthorName::new).collect(),
        title: hit.title,
        journal: hit.venue,
        publication_year: hit.year,
        publication_date: hit.year.map(|y| y.to_string()),
        abstract_text: hit.snippet.as_deref().map(normalize::clean_abstract),
        is_published: Some(hit.year.is_some()),
        type_label: Some("scholar".to_string()),
        pdf_url: hit.pdf.or(hit.link),
        cited_by_count: hit.cited_by,
        ..Default::default()
    }
    .build(Source::Scholar, query_url)
}

struct ScholarPages<'a> {
    client: &'a ScholarClient,
    query: &'a str,
    opts: &'a FetchOptions,
}

#[async_trait]
impl PageFetcher for ScholarPages<'_> {
    fn source(&self) -> Source {
        Source::Scholar
    }

    fn page_delay(&self) -> Duration {
        self.client.page_delay
    }

    async fn fetch_page(&self, cursor: &Cursor, _page_size: usize) -> Result<Page, SourceError> {
        let start = cursor
            .offset()
            .ok_or_else(|| SourceError::Api("Scholar pages by offset only".to_string()))?;
        let mut params = vec![
            ("q", self.query.to_string()),
            ("hl", "en".to_string()),
            ("start", start.to_string()),
        ];
        let (from, to) = self.opts.year_range();
        if let Some(from) = from {
            params.push(("as_ylo", from.to_string()));
        }
        if let Some(to) = to {
            params.push(("as_yhi", to.to_string()));
        }
        let url = build_url(&self.client.base_url, &params)?;
        let body = self.client.http.text(self.client.http.get(url.clone())).await?;

        let hits = parse_results(&body)?;
        Ok(Page {
            raw_len: hits.len(),
            records: hits
                .into_iter()
                .map(|h| hit_to_record(h, url.as_str()))
                .collect(),
            total: None,
            next: None,
        })
    }
}

#[async_trait]
impl PaperSource for ScholarClient {
    fn source(&self) -> Source {
        Source::Scholar
    }

    #[tracing::instrument(skip(self, opts), fields(source = "scholar"))]
    async fn fetch(&self, query: &str, opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        let pages = ScholarPages {
            client: self,
            query,
            opts,
        };
        paginate::collect(&pages, PAGE_SIZE, opts.max_records).await
    }
}
