use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::apis::{self, PaperSource, SourceContext, SourceError, Unconfigured};
use crate::cache::{self, ResponseCache};
use crate::record::Source;
use crate::retry::RetryPolicy;
use crate::search::SourceSlot;

const DEFAULT_SOURCES: &str = "arxiv,crossref,openalex";
const DEFAULT_MAX_RESULTS: usize = 100;
const DEFAULT_PUBMED_TOOL: &str = "review-search";
const DEFAULT_CACHE_EXPIRE_SECS: u64 = 3600;
const DEFAULT_RETRY_BASE_MS: u64 = 1000;
const DEFAULT_RETRY_MAX_MS: u64 = 10_000;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sources queried when a request names none.
    pub default_sources: Vec<String>,
    /// Per-source record cap when a request sets none.
    pub max_results: usize,
    pub scopus_api_key: Option<String>,
    pub springer_api_key: Option<String>,
    pub ieee_api_key: Option<String>,
    pub pubmed_api_key: Option<String>,
    pub pubmed_email: Option<String>,
    pub pubmed_tool: String,
    pub openalex_email: Option<String>,
    pub openalex_oa_only: bool,
    pub scholar_proxy: Option<String>,
    pub cache_enabled: bool,
    pub cache_expire: Duration,
    pub cache_max_entries: u64,
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from the process environment, reading `.env` first
    /// when one exists.
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::info!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset; malformed
    /// values fall back to defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let default_sources = get("REVIEW_SEARCH_SOURCES")
            .unwrap_or_else(|| DEFAULT_SOURCES.to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let base_ms = parse_or(&get, "RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_MS);
        let max_ms = parse_or(&get, "RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_MS);
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms.max(base_ms)),
            ..RetryPolicy::default()
        };

        Self {
            default_sources,
            max_results: parse_or(&get, "MAX_RESULTS", DEFAULT_MAX_RESULTS),
            scopus_api_key: get("SCOPUS_API_KEY"),
            springer_api_key: get("SPRINGER_API_KEY"),
            ieee_api_key: get("IEEE_API_KEY"),
            pubmed_api_key: get("PUBMED_API_KEY"),
            pubmed_email: get("PUBMED_EMAIL"),
            pubmed_tool: get("PUBMED_TOOL").unwrap_or_else(|| DEFAULT_PUBMED_TOOL.to_string()),
            openalex_email: get("OPENALEX_EMAIL"),
            openalex_oa_only: flag_or(&get, "OPENALEX_OA_ONLY", true),
            scholar_proxy: get("SCHOLAR_PROXY"),
            cache_enabled: flag_or(&get, "CACHE_ENABLED", false),
            cache_expire: Duration::from_secs(parse_or(&get, "CACHE_EXPIRE", DEFAULT_CACHE_EXPIRE_SECS)),
            cache_max_entries: parse_or(&get, "CACHE_MAX_ENTRIES", cache::DEFAULT_MAX_ENTRIES),
            retry,
        }
    }

    /// Retry policy and, when enabled, a fresh response cache. Build once and
    /// share it across requests.
    pub fn source_context(&self) -> SourceContext {
        SourceContext {
            retry: self.retry.clone(),
            cache: self
                .cache_enabled
                .then(|| Arc::new(ResponseCache::new(self.cache_expire, self.cache_max_entries))),
        }
    }

    /// Construct one adapter. Sources with a missing required key come back
    /// as [`Unconfigured`] so the failure is reported per source.
    pub fn build_source(&self, source: Source, ctx: &SourceContext) -> Result<Arc<dyn PaperSource>, SourceError> {
        let keyed = |key: &Option<String>, variable: &'static str| -> Option<String> {
            if key.is_none() {
                tracing::warn!(%source, "{} not set", variable);
            }
            key.clone()
        };
        let built: Arc<dyn PaperSource> = match source {
            Source::Arxiv => Arc::new(apis::arxiv::ArxivClient::new(ctx)?),
            Source::Crossref => Arc::new(apis::crossref::CrossRefClient::new(ctx, self.openalex_email.clone())?),
            Source::OpenAlex => Arc::new(apis::openalex::OpenAlexClient::new(
                ctx,
                self.openalex_email.clone(),
                self.openalex_oa_only,
            )?),
            Source::Plos => Arc::new(apis::plos::PlosClient::new(ctx)?),
            Source::PubMed => Arc::new(apis::pubmed::PubMedClient::new(
                ctx,
                self.pubmed_api_key.clone(),
                self.pubmed_email.clone(),
                self.pubmed_tool.clone(),
            )?),
            Source::Scopus => match keyed(&self.scopus_api_key, "SCOPUS_API_KEY") {
                Some(key) => Arc::new(apis::scopus::ScopusClient::new(ctx, key)?),
                None => Arc::new(Unconfigured::new(source, "SCOPUS_API_KEY")),
            },
            Source::SpringerNature => match keyed(&self.springer_api_key, "SPRINGER_API_KEY") {
                Some(key) => Arc::new(apis::springer::SpringerClient::new(ctx, key)?),
                None => Arc::new(Unconfigured::new(source, "SPRINGER_API_KEY")),
            },
            Source::Scholar => Arc::new(apis::scholar::ScholarClient::new(ctx, self.scholar_proxy.as_deref())?),
            Source::Ieee => match keyed(&self.ieee_api_key, "IEEE_API_KEY") {
                Some(key) => Arc::new(apis::ieee::IeeeClient::new(ctx, key)?),
                None => Arc::new(Unconfigured::new(source, "IEEE_API_KEY")),
            },
        };
        Ok(built)
    }

    /// Turn requested names (or the defaults when none) into slots, in
    /// request order. Unknown names become broken slots; repeats are dropped.
    pub fn resolve_sources(&self, names: &[String], ctx: &SourceContext) -> Vec<SourceSlot> {
        let names: &[String] = if names.is_empty() {
            &self.default_sources
        } else {
            names
        };
        let mut seen = Vec::new();
        let mut slots = Vec::new();
        for name in names {
            let slot = match Source::from_str(name) {
                Ok(source) if seen.contains(&source) => {
                    tracing::warn!(name = %name, "source requested twice, ignoring repeat");
                    continue;
                }
                Ok(source) => {
                    seen.push(source);
                    match self.build_source(source, ctx) {
                        Ok(built) => SourceSlot::Ready(built),
                        Err(e) => SourceSlot::broken(source.tag(), &e),
                    }
                }
                Err(_) => SourceSlot::broken(name.as_str(), &SourceError::UnknownSource(name.clone())),
            };
            slots.push(slot);
        }
        slots
    }

    /// One entry per source with its credential state.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        Source::ALL
            .iter()
            .map(|&source| {
                let (configured, note) = match source {
                    Source::Scopus => key_note(&self.scopus_api_key, "SCOPUS_API_KEY"),
                    Source::SpringerNature => key_note(&self.springer_api_key, "SPRINGER_API_KEY"),
                    Source::Ieee => key_note(&self.ieee_api_key, "IEEE_API_KEY"),
                    Source::PubMed if self.pubmed_api_key.is_some() => (true, "API key set".to_string()),
                    Source::PubMed => (true, "No API key (3 requests/s)".to_string()),
                    Source::OpenAlex if self.openalex_email.is_some() => (true, "Polite pool email set".to_string()),
                    Source::Scholar if self.scholar_proxy.is_some() => (true, "HTML scraping via proxy".to_string()),
                    Source::Scholar => (true, "HTML scraping".to_string()),
                    _ => (true, "No API key required".to_string()),
                };
                SourceStatus {
                    name: source.tag().to_string(),
                    display_name: source.index_name().to_string(),
                    default: self.default_sources.iter().any(|s| s == source.tag()),
                    configured,
                    note,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub display_name: String,
    /// Queried when a request names no sources.
    pub default: bool,
    pub configured: bool,
    pub note: String,
}

fn key_note(key: &Option<String>, variable: &str) -> (bool, String) {
    match key {
        Some(_) => (true, "API key set".to_string()),
        None => (false, format!("Unavailable: {} not set", variable)),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("{}={:?} is not valid, using {}", key, raw, default);
            default
        }),
    }
}

fn flag_or<G>(get: &G, key: &str, default: bool) -> bool
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_lowercase()).as_deref() {
        None => default,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            tracing::warn!("{}={:?} is not a boolean, using {}", key, other, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{ErrorKind, FetchOptions};
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.default_sources, vec!["arxiv", "crossref", "openalex"]);
        assert_eq!(cfg.max_results, 100);
        assert_eq!(cfg.pubmed_tool, "review-search");
        assert!(cfg.openalex_oa_only);
        assert!(!cfg.cache_enabled);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(1000));
        assert!(cfg.source_context().cache.is_none());
    }

    #[test]
    fn test_values_and_malformed_fallbacks() {
        let cfg = config(&[
            ("REVIEW_SEARCH_SOURCES", " PubMed, scopus ,"),
            ("MAX_RESULTS", "lots"),
            ("OPENALEX_OA_ONLY", "no"),
            ("CACHE_ENABLED", "true"),
            ("CACHE_EXPIRE", "60"),
            ("RETRY_BASE_DELAY_MS", "250"),
            ("SCOPUS_API_KEY", "  "),
        ]);
        assert_eq!(cfg.default_sources, vec!["pubmed", "scopus"]);
        assert_eq!(cfg.max_results, 100);
        assert!(!cfg.openalex_oa_only);
        assert_eq!(cfg.cache_expire, Duration::from_secs(60));
        assert_eq!(cfg.cache_max_entries, cache::DEFAULT_MAX_ENTRIES);
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(250));
        assert!(cfg.scopus_api_key.is_none());
        assert!(cfg.source_context().cache.is_some());
    }

    #[test]
    fn test_resolve_keeps_order_and_reports_unknown_names() {
        let cfg = config(&[("IEEE_API_KEY", "k")]);
        let ctx = cfg.source_context();
        let names: Vec<String> = ["ieee", "nosuch", "arxiv", "IEEE"].iter().map(|s| s.to_string()).collect();
        let slots = cfg.resolve_sources(&names, &ctx);
        let resolved: Vec<_> = slots.iter().map(|s| s.name()).collect();
        assert_eq!(resolved, vec!["ieee", "nosuch", "arxiv"]);
        match &slots[1] {
            SourceSlot::Broken { failure, .. } => assert_eq!(failure.kind, ErrorKind::Config),
            SourceSlot::Ready(_) => panic!("unknown source resolved"),
        }
    }

    #[test]
    fn test_empty_request_uses_defaults() {
        let cfg = config(&[("REVIEW_SEARCH_SOURCES", "plos")]);
        let slots = cfg.resolve_sources(&[], &cfg.source_context());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].name(), "plos");
    }

    #[tokio::test]
    async fn test_missing_key_fails_at_fetch_time() {
        let cfg = config(&[]);
        let source = cfg.build_source(Source::Scopus, &cfg.source_context()).unwrap();
        let err = source.fetch("q", &FetchOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.to_string().contains("SCOPUS_API_KEY"));
    }

    #[test]
    fn test_source_status_lists_every_source() {
        let cfg = config(&[("SPRINGER_API_KEY", "k")]);
        let status = cfg.source_status();
        assert_eq!(status.len(), 9);
        let scopus = status.iter().find(|s| s.name == "scopus").unwrap();
        assert!(!scopus.configured);
        let springer = status.iter().find(|s| s.name == "springernature").unwrap();
        assert!(springer.configured);
        assert!(status.iter().find(|s| s.name == "arxiv").unwrap().default);
    }
}
