use std::path::Path;

use anyhow::{Context, Result};

use crate::pretriage::ScoredRecord;
use crate::record::CanonicalRecord;

/// Columns appended to pretriaged output.
pub const SCORE_COLUMNS: [&str; 2] = ["score_inclusion", "score_exclusion"];

/// Write records as the canonical twenty-column table. The header is written
/// even when there are no records.
pub fn write_csv(path: &Path, records: &[CanonicalRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(CanonicalRecord::COLUMNS)?;
    for record in records {
        writer.write_record(record.values())?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = records.len(), "CSV written");
    Ok(())
}

/// Canonical columns followed by the two pretriage scores.
pub fn write_scored_csv(path: &Path, records: &[ScoredRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(CanonicalRecord::COLUMNS.iter().chain(SCORE_COLUMNS.iter()))?;
    for scored in records {
        let inclusion = format!("{:.4}", scored.score_inclusion);
        let exclusion = format!("{:.4}", scored.score_exclusion);
        writer.write_record(
            scored
                .record
                .values()
                .into_iter()
                .chain([inclusion.as_str(), exclusion.as_str()]),
        )?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = records.len(), "scored CSV written");
    Ok(())
}

/// Read a canonical table back. Extra columns (scores, triage notes) are
/// ignored; blank cells come back as the sentinel.
pub fn read_csv(path: &Path) -> Result<Vec<CanonicalRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let missing: Vec<&str> = CanonicalRecord::COLUMNS
        .iter()
        .copied()
        .filter(|c| !headers.iter().any(|h| h.trim() == *c))
        .collect();
    anyhow::ensure!(
        missing.is_empty(),
        "{} is missing columns: {}",
        path.display(),
        missing.join(", ")
    );

    let mut records = Vec::new();
    for (row, result) in reader.deserialize::<CanonicalRecord>().enumerate() {
        let record = result.with_context(|| format!("Bad row {} in {}", row + 1, path.display()))?;
        records.push(record.fill_missing());
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordDraft, Source};

    fn sample() -> Vec<CanonicalRecord> {
        vec![
            RecordDraft {
                doi: Some("10.1/a".into()),
                title: Some("Commas, \"quotes\" and\nnewlines".into()),
                publication_year: Some(2020),
                ..Default::default()
            }
            .build(Source::Crossref, "q"),
            RecordDraft::default().build(Source::Arxiv, "https://export.arxiv.org/api/query?x=1"),
        ]
    }

    #[test]
    fn test_write_then_read_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let records = sample();
        write_csv(&path, &records).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("ID,Authors,Authors Year,Title,Journal,"));
        assert_eq!(read_csv(&path).unwrap(), records);
    }

    #[test]
    fn test_empty_export_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_csv(&path, &[]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(read_csv(&path).unwrap().is_empty());
    }

    #[test]
    fn test_scored_output_appends_columns_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scored.csv");
        let scored: Vec<ScoredRecord> = sample()
            .into_iter()
            .map(|record| ScoredRecord {
                record,
                score_inclusion: 0.61234,
                score_exclusion: 0.0,
            })
            .collect();
        write_scored_csv(&path, &scored).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.ends_with("API,score_inclusion,score_exclusion"));
        assert!(text.contains("0.6123"));
        assert_eq!(read_csv(&path).unwrap()[0], scored[0].record);
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "ID,Title\n1,x\n").unwrap();
        let err = read_csv(&path).unwrap_err();
        assert!(err.to_string().contains("missing columns"));
    }

    #[test]
    fn test_blank_cells_become_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.csv");
        let mut text = CanonicalRecord::COLUMNS.join(",");
        text.push('\n');
        text.push_str("X1");
        text.push_str(&",".repeat(19));
        text.push('\n');
        std::fs::write(&path, text).unwrap();
        let records = read_csv(&path).unwrap();
        assert_eq!(records[0].id(), "X1");
        assert_eq!(records[0].doi(), "N/A");
    }
}
