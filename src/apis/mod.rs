pub mod arxiv;
pub mod crossref;
pub mod http;
pub mod ieee;
pub mod openalex;
pub mod paginate;
pub mod plos;
pub mod pubmed;
pub mod scholar;
pub mod scopus;
pub mod springer;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;

use crate::cache::ResponseCache;
use crate::record::{CanonicalRecord, Source};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Missing API key: {0}")]
    MissingKey(String),
    #[error("Unknown source: {0}")]
    UnknownSource(String),
    #[error("Unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: Box<SourceError> },
}

/// Coarse failure class reported per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Auth,
    Schema,
    Unavailable,
    Config,
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Http(e) if e.is_decode() => ErrorKind::Schema,
            SourceError::Http(_) => ErrorKind::Transient,
            SourceError::Status { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::Transient
            }
            SourceError::Status { .. } | SourceError::Api(_) | SourceError::MissingKey(_) => {
                ErrorKind::Auth
            }
            SourceError::Parse(_) => ErrorKind::Schema,
            SourceError::UnknownSource(_) => ErrorKind::Config,
            SourceError::Unavailable { .. } => ErrorKind::Unavailable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Per-call retrieval options shared by every adapter.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Upper bound on returned records; `None` retrieves everything.
    pub max_records: Option<usize>,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
}

impl FetchOptions {
    pub fn with_limit(max_records: usize) -> Self {
        Self {
            max_records: Some(max_records),
            ..Default::default()
        }
    }

    /// Year bounds: explicit years first, then the years of the date bounds.
    pub fn year_range(&self) -> (Option<i32>, Option<i32>) {
        (
            self.start_year.or_else(|| self.from_date.map(|d| d.year())),
            self.end_year.or_else(|| self.to_date.map(|d| d.year())),
        )
    }

    /// Date bounds: explicit dates first, then whole years.
    pub fn date_range(&self) -> (Option<NaiveDate>, Option<NaiveDate>) {
        (
            self.from_date
                .or_else(|| self.start_year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1))),
            self.to_date
                .or_else(|| self.end_year.and_then(|y| NaiveDate::from_ymd_opt(y, 12, 31))),
        )
    }

    /// Unknown years are kept.
    pub fn accepts_year(&self, year: Option<i32>) -> bool {
        let Some(year) = year else { return true };
        let (start, end) = self.year_range();
        start.map_or(true, |s| year >= s) && end.map_or(true, |e| year <= e)
    }

    pub fn limit_reached(&self, count: usize) -> bool {
        self.max_records.is_some_and(|m| count >= m)
    }

    /// Page size for a backend: the limit when smaller, never above `max`.
    pub fn page_size(&self, default: usize, max: usize) -> usize {
        self.max_records.unwrap_or(default).clamp(1, max)
    }
}

/// Shared retry policy and optional response cache handed to every client.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub retry: RetryPolicy,
    pub cache: Option<Arc<ResponseCache>>,
}

#[async_trait]
pub trait PaperSource: Send + Sync {
    fn source(&self) -> Source;

    fn name(&self) -> &str {
        self.source().tag()
    }

    async fn fetch(
        &self,
        query: &str,
        opts: &FetchOptions,
    ) -> Result<Vec<CanonicalRecord>, SourceError>;
}

/// Stand-in for a source whose credentials are missing. Every fetch fails
/// with [`SourceError::MissingKey`] so the failure shows up per source.
pub struct Unconfigured {
    source: Source,
    variable: &'static str,
}

impl Unconfigured {
    pub fn new(source: Source, variable: &'static str) -> Self {
        Self { source, variable }
    }
}

#[async_trait]
impl PaperSource for Unconfigured {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, _query: &str, _opts: &FetchOptions) -> Result<Vec<CanonicalRecord>, SourceError> {
        Err(SourceError::MissingKey(format!(
            "{} requires {} to be set",
            self.source, self.variable
        )))
    }
}

pub(crate) fn build_url(base: &str, params: &[(&str, String)]) -> Result<Url, SourceError> {
    Url::parse_with_params(base, params.iter().map(|(k, v)| (*k, v.as_str())))
        .map_err(|e| SourceError::Api(format!("invalid URL {}: {}", base, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let status = |s| SourceError::Status { status: s, body: String::new() };
        assert_eq!(status(503).kind(), ErrorKind::Transient);
        assert_eq!(status(429).kind(), ErrorKind::Transient);
        assert_eq!(status(401).kind(), ErrorKind::Auth);
        assert_eq!(status(404).kind(), ErrorKind::Auth);
        assert_eq!(SourceError::Parse("x".into()).kind(), ErrorKind::Schema);
        assert_eq!(SourceError::MissingKey("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(SourceError::UnknownSource("x".into()).kind(), ErrorKind::Config);
        let wrapped = SourceError::Unavailable { attempts: 3, last: Box::new(status(500)) };
        assert_eq!(wrapped.kind(), ErrorKind::Unavailable);
        assert!(!wrapped.is_transient());
    }

    #[test]
    fn test_year_and_date_ranges() {
        let opts = FetchOptions {
            from_date: NaiveDate::from_ymd_opt(2020, 6, 1),
            end_year: Some(2022),
            ..Default::default()
        };
        assert_eq!(opts.year_range(), (Some(2020), Some(2022)));
        assert_eq!(
            opts.date_range(),
            (NaiveDate::from_ymd_opt(2020, 6, 1), NaiveDate::from_ymd_opt(2022, 12, 31))
        );
        assert!(opts.accepts_year(Some(2021)));
        assert!(!opts.accepts_year(Some(2019)));
        assert!(opts.accepts_year(None));
    }

    #[test]
    fn test_page_size_clamps_to_limit() {
        assert_eq!(FetchOptions::with_limit(5).page_size(100, 200), 5);
        assert_eq!(FetchOptions::with_limit(5000).page_size(100, 200), 200);
        assert_eq!(FetchOptions::default().page_size(100, 200), 100);
    }

    #[tokio::test]
    async fn test_unconfigured_source_fails_with_missing_key() {
        let src = Unconfigured::new(Source::Scopus, "SCOPUS_API_KEY");
        let err = src.fetch("q", &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, SourceError::MissingKey(_)));
        assert_eq!(src.name(), "scopus");
    }
}
