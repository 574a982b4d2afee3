use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::apis::{ErrorKind, FetchOptions, PaperSource, SourceError};
use crate::record::{CanonicalRecord, NOT_AVAILABLE};

/// One requested source: either a live adapter or the reason it could not be
/// built (unknown name and similar).
#[derive(Clone)]
pub enum SourceSlot {
    Ready(Arc<dyn PaperSource>),
    Broken { name: String, failure: SourceFailure },
}

impl SourceSlot {
    pub fn broken(name: impl Into<String>, err: &SourceError) -> Self {
        SourceSlot::Broken {
            name: name.into(),
            failure: SourceFailure::from(err),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SourceSlot::Ready(source) => source.name(),
            SourceSlot::Broken { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SourceError> for SourceFailure {
    fn from(err: &SourceError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one source for one query.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SourceFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Every source answered and at least one record came back.
    Complete,
    /// Every source answered, none had records.
    NoResults,
    /// Some sources failed, the rest still contributed.
    Partial,
    AllFailed,
}

impl QueryStatus {
    fn from_reports(reports: &[SourceReport], record_count: usize) -> Self {
        let failed = reports.iter().filter(|r| r.failure.is_some()).count();
        match (failed, record_count) {
            (0, 0) => QueryStatus::NoResults,
            (0, _) => QueryStatus::Complete,
            (f, _) if f == reports.len() => QueryStatus::AllFailed,
            _ => QueryStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub query: String,
    pub status: QueryStatus,
    pub sources: Vec<SourceReport>,
    pub duplicates_removed: usize,
    pub records: Vec<CanonicalRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub queries: Vec<QueryReport>,
}

impl SearchReport {
    /// All queries' records in order, deduplicated again across queries.
    pub fn merged_records(&self) -> Vec<CanonicalRecord> {
        let all = self
            .queries
            .iter()
            .flat_map(|q| q.records.iter().cloned())
            .collect();
        deduplicate(all).0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub queries: Vec<String>,
    /// Source names as given by the caller; resolved into [`SourceSlot`]s by
    /// the configuration layer.
    pub sources: Vec<String>,
    pub options: FetchOptions,
}

/// Drop records whose (DOI, Title) pair was already seen, keeping the first.
/// Returns the survivors and the number removed.
///
/// Records with both DOI and Title unavailable never match each other.
pub fn deduplicate(records: Vec<CanonicalRecord>) -> (Vec<CanonicalRecord>, usize) {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let before = records.len();
    let kept: Vec<CanonicalRecord> = records
        .into_iter()
        .filter(|r| {
            if r.doi() == NOT_AVAILABLE && r.title() == NOT_AVAILABLE {
                return true;
            }
            seen.insert((r.doi().to_string(), r.title().to_string()))
        })
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Run one query against every slot concurrently, one task per source.
/// Output keeps slot order regardless of completion order; a failing source
/// contributes nothing and is reported, never fatal.
pub async fn federated_search(slots: &[SourceSlot], query: &str, opts: &FetchOptions) -> QueryReport {
    let tasks = slots.iter().map(|slot| {
        let handle = match slot {
            SourceSlot::Ready(source) => {
                let source = Arc::clone(source);
                let query = query.to_string();
                let opts = opts.clone();
                Some(tokio::spawn(async move { source.fetch(&query, &opts).await }))
            }
            SourceSlot::Broken { .. } => None,
        };
        async move {
            match handle {
                Some(handle) => Some(handle.await),
                None => None,
            }
        }
    });
    let joined = join_all(tasks).await;

    let mut reports = Vec::with_capacity(slots.len());
    let mut all_records = Vec::new();
    for (slot, joined) in slots.iter().zip(joined) {
        let name = slot.name().to_string();
        let outcome = match (slot, joined) {
            (SourceSlot::Broken { failure, .. }, _) => Err(failure.clone()),
            (SourceSlot::Ready(_), Some(Ok(Ok(records)))) => Ok(records),
            (SourceSlot::Ready(_), Some(Ok(Err(e)))) => Err(SourceFailure::from(&e)),
            (SourceSlot::Ready(_), Some(Err(e))) => Err(SourceFailure {
                kind: ErrorKind::Unavailable,
                message: format!("source task aborted: {}", e),
            }),
            (SourceSlot::Ready(_), None) => continue,
        };
        match outcome {
            Ok(records) => {
                tracing::info!(source = %name, query, count = records.len(), "source finished");
                reports.push(SourceReport {
                    source: name,
                    records: records.len(),
                    failure: None,
                });
                all_records.extend(records);
            }
            Err(failure) => {
                tracing::warn!(source = %name, query, kind = ?failure.kind, "source skipped: {}", failure.message);
                reports.push(SourceReport {
                    source: name,
                    records: 0,
                    failure: Some(failure),
                });
            }
        }
    }

    let (records, duplicates_removed) = deduplicate(all_records);
    let status = QueryStatus::from_reports(&reports, records.len());
    QueryReport {
        query: query.to_string(),
        status,
        sources: reports,
        duplicates_removed,
        records,
    }
}

/// Queries run one after another; sources within a query run concurrently.
pub async fn run_search(slots: &[SourceSlot], request: &SearchRequest) -> SearchReport {
    let mut queries = Vec::with_capacity(request.queries.len());
    for query in &request.queries {
        let report = federated_search(slots, query, &request.options).await;
        tracing::info!(
            query = %query,
            status = ?report.status,
            records = report.records.len(),
            duplicates = report.duplicates_removed,
            "query finished"
        );
        queries.push(report);
    }
    SearchReport { queries }
}
