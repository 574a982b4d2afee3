use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

mod apis;
mod cache;
mod config;
mod export;
mod normalize;
mod pretriage;
mod record;
mod retry;
mod search;

use apis::{FetchOptions, SourceContext};
use config::Config;
use pretriage::{Embedder, HashingEmbedder, PretriageConfig};
use search::SearchRequest;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchRecordsParams {
    #[schemars(description = "Search queries, run one after another")]
    queries: Vec<String>,
    #[schemars(description = "Sources to query (e.g. [\"arxiv\", \"pubmed\"]); defaults to REVIEW_SEARCH_SOURCES")]
    sources: Option<Vec<String>>,
    #[schemars(description = "Earliest publication date, YYYY-MM-DD")]
    from_date: Option<String>,
    #[schemars(description = "Latest publication date, YYYY-MM-DD")]
    to_date: Option<String>,
    #[schemars(description = "Earliest publication year")]
    start_year: Option<i32>,
    #[schemars(description = "Latest publication year")]
    end_year: Option<i32>,
    #[schemars(description = "Maximum records per source and query (default MAX_RESULTS, 0 = no limit)")]
    max_records: Option<usize>,
    #[schemars(description = "Write the merged, deduplicated records to this CSV path")]
    output_csv: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PretriageParams {
    #[schemars(description = "Canonical CSV produced by search_records")]
    input_csv: String,
    #[schemars(description = "Where to write the surviving rows with score columns")]
    output_csv: String,
    #[schemars(description = "Inclusion keywords or phrases; empty keeps every record")]
    inclusion: Vec<String>,
    #[schemars(description = "Exclusion keywords or phrases")]
    exclusion: Option<Vec<String>>,
    #[schemars(description = "Minimum inclusion similarity (default 0.3)")]
    inclusion_threshold: Option<f32>,
    #[schemars(description = "Maximum exclusion similarity (default 0.3)")]
    exclusion_threshold: Option<f32>,
}

fn parse_date(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, McpError> {
    value
        .map(|v| {
            NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").map_err(|e| {
                McpError::invalid_params(format!("{} must be YYYY-MM-DD: {}", field, e), None)
            })
        })
        .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ReviewSearchServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    context: SourceContext,
    embedder: Arc<dyn Embedder>,
}

#[tool_router]
impl ReviewSearchServer {
    pub fn new(config: Config) -> Self {
        let context = config.source_context();
        tracing::info!(
            default_sources = ?config.default_sources,
            cache = config.cache_enabled,
            "configuration loaded"
        );
        Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            context,
            embedder: Arc::new(HashingEmbedder::default()),
        }
    }

    #[tool(description = "List the bibliographic sources, which are queried by default and whether their credentials are set")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        to_json(&self.config.source_status())
    }

    #[tool(description = "Run queries against the selected sources. Returns a per-query report (status, per-source counts and failures) with the deduplicated records.")]
    async fn search_records(
        &self,
        Parameters(params): Parameters<SearchRecordsParams>,
    ) -> Result<CallToolResult, McpError> {
        let queries: Vec<String> = params
            .queries
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if queries.is_empty() {
            return Err(McpError::invalid_params("at least one query is required".to_string(), None));
        }

        let options = FetchOptions {
            max_records: match params.max_records.unwrap_or(self.config.max_results) {
                0 => None,
                n => Some(n),
            },
            start_year: params.start_year,
            end_year: params.end_year,
            from_date: parse_date("from_date", params.from_date.as_deref())?,
            to_date: parse_date("to_date", params.to_date.as_deref())?,
        };
        if let (Some(from), Some(to)) = options.date_range() {
            if from > to {
                return Err(McpError::invalid_params(
                    format!("date range is empty: {} is after {}", from, to),
                    None,
                ));
            }
        }

        let request = SearchRequest {
            queries,
            sources: params.sources.unwrap_or_default(),
            options,
        };
        let slots = self.config.resolve_sources(&request.sources, &self.context);
        let report = search::run_search(&slots, &request).await;

        let mut written = None;
        if let Some(path) = params.output_csv {
            let path = PathBuf::from(path);
            let merged = report.merged_records();
            export::write_csv(&path, &merged)
                .map_err(|e| McpError::internal_error(format!("CSV export failed: {:#}", e), None))?;
            written = Some(serde_json::json!({"path": path.display().to_string(), "rows": merged.len()}));
        }

        to_json(&serde_json::json!({
            "output_csv": written,
            "queries": report.queries,
        }))
    }

    #[tool(description = "Score the records of a canonical CSV against inclusion/exclusion keywords and write the survivors with score_inclusion and score_exclusion columns")]
    async fn pretriage_csv(
        &self,
        Parameters(params): Parameters<PretriageParams>,
    ) -> Result<CallToolResult, McpError> {
        let input = PathBuf::from(&params.input_csv);
        let output = PathBuf::from(&params.output_csv);
        let records = export::read_csv(&input)
            .map_err(|e| McpError::invalid_params(format!("Cannot read input CSV: {:#}", e), None))?;

        let config = PretriageConfig {
            inclusion: params.inclusion,
            exclusion: params.exclusion.unwrap_or_default(),
            inclusion_threshold: params.inclusion_threshold.unwrap_or(pretriage::DEFAULT_THRESHOLD),
            exclusion_threshold: params.exclusion_threshold.unwrap_or(pretriage::DEFAULT_THRESHOLD),
        };
        let kept = pretriage::pretriage(&records, &config, self.embedder.as_ref());
        export::write_scored_csv(&output, &kept)
            .map_err(|e| McpError::internal_error(format!("CSV export failed: {:#}", e), None))?;

        to_json(&serde_json::json!({
            "input_rows": records.len(),
            "kept_rows": kept.len(),
            "output_csv": output.display().to_string(),
        }))
    }
}

#[tool_handler]
impl ServerHandler for ReviewSearchServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Collect bibliographic records for a literature review. Queries arXiv, \
                 Crossref, OpenAlex, PLOS, PubMed, Scopus, SpringerNature, Google Scholar \
                 and IEEE Xplore, normalizes results into one 20-column record, \
                 deduplicates by (DOI, Title), exports CSV and pretriages by keyword \
                 similarity."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting review-search MCP server");

    let server = ReviewSearchServer::new(Config::from_env());
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
