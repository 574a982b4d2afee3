use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::normalize::{self, AuthorName};

/// Sentinel written into every field whose value is unknown.
pub const NOT_AVAILABLE: &str = "N/A";

/// The nine bibliographic backends the engine can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Arxiv,
    Crossref,
    OpenAlex,
    Plos,
    PubMed,
    Scopus,
    SpringerNature,
    Scholar,
    Ieee,
}

impl Source {
    pub const ALL: [Source; 9] = [
        Source::Arxiv,
        Source::Crossref,
        Source::OpenAlex,
        Source::Plos,
        Source::PubMed,
        Source::Scopus,
        Source::SpringerNature,
        Source::Scholar,
        Source::Ieee,
    ];

    /// Short tag written into the `API` column.
    pub fn tag(&self) -> &'static str {
        match self {
            Source::Arxiv => "arxiv",
            Source::Crossref => "crossref",
            Source::OpenAlex => "openalex",
            Source::Plos => "plos",
            Source::PubMed => "pubmed",
            Source::Scopus => "scopus",
            Source::SpringerNature => "springernature",
            Source::Scholar => "scholar",
            Source::Ieee => "ieee",
        }
    }

    /// Default value of the `Indexed In` column.
    pub fn index_name(&self) -> &'static str {
        match self {
            Source::Arxiv => "arXiv",
            Source::Crossref => "Crossref",
            Source::OpenAlex => "OpenAlex",
            Source::Plos => "PLOS",
            Source::PubMed => "PubMed",
            Source::Scopus => "Scopus",
            Source::SpringerNature => "SpringerNature",
            Source::Scholar => "Google Scholar",
            Source::Ieee => "IEEE Xplore",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "arxiv" => Ok(Source::Arxiv),
            "crossref" => Ok(Source::Crossref),
            "openalex" => Ok(Source::OpenAlex),
            "plos" => Ok(Source::Plos),
            "pubmed" => Ok(Source::PubMed),
            "scopus" => Ok(Source::Scopus),
            "springernature" | "springer" => Ok(Source::SpringerNature),
            "scholar" | "google_scholar" | "googlescholar" => Ok(Source::Scholar),
            "ieee" | "ieeexplore" | "ieee_xplore" => Ok(Source::Ieee),
            other => Err(format!("unknown source: {}", other)),
        }
    }
}

macro_rules! canonical_record {
    ($( $field:ident => $column:literal ),+ $(,)?) => {
        /// One bibliographic entry in the fixed 20-column layout.
        ///
        /// Fields are only reachable through getters; every instance is built by
        /// [`RecordDraft::build`] (or read back from an exported table), so no
        /// field is ever empty.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct CanonicalRecord {
            $(
                #[serde(rename = $column)]
                $field: String,
            )+
        }

        impl CanonicalRecord {
            /// Column names in export order.
            pub const COLUMNS: [&'static str; 20] = [$($column),+];

            $(
                pub fn $field(&self) -> &str {
                    &self.$field
                }
            )+

            /// Field values in the same order as [`Self::COLUMNS`].
            pub fn values(&self) -> [&str; 20] {
                [$(self.$field.as_str()),+]
            }

            /// Replace blank fields with the sentinel, e.g. after reading a
            /// hand-edited table.
            pub(crate) fn fill_missing(mut self) -> Self {
                $(
                    if self.$field.trim().is_empty() {
                        self.$field = NOT_AVAILABLE.to_string();
                    }
                )+
                self
            }
        }
    };
}

canonical_record! {
    id => "ID",
    authors => "Authors",
    authors_year => "Authors Year",
    title => "Title",
    journal => "Journal",
    publication_year => "Publication Year",
    publication_date => "Publication Date",
    abstract_text => "Abstract",
    doi => "DOI",
    language => "Language",
    is_accepted => "Is Accepted",
    is_published => "Is Published",
    type_label => "Type",
    type_crossref => "Type Crossref",
    indexed_in => "Indexed In",
    is_open_access => "Is Open Access",
    oa_status => "OA Status",
    download_url => "Download URL",
    cited_by_count => "Cited By Count",
    api => "API",
}

/// Typed intermediate every adapter fills before producing a [`CanonicalRecord`].
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
    pub native_id: Option<String>,
    pub authors: Vec<AuthorName>,
    pub title: Option<String>,
    pub journal: Option<String>,
    pub publication_year: Option<i32>,
    pub publication_date: Option<String>,
    pub abstract_text: Option<String>,
    pub doi: Option<String>,
    pub language: Option<String>,
    pub is_accepted: Option<bool>,
    pub is_published: Option<bool>,
    pub type_label: Option<String>,
    pub type_crossref: Option<String>,
    /// Overrides [`Source::index_name`] when the backend reports its own list.
    pub indexed_in: Option<String>,
    pub is_open_access: Option<bool>,
    pub oa_status: Option<String>,
    pub pdf_url: Option<String>,
    pub cited_by_count: Option<u64>,
}

impl RecordDraft {
    /// Finalize into the canonical layout. `query_url` is the request that
    /// produced the record and serves as the last-resort identifier.
    pub fn build(self, source: Source, query_url: &str) -> CanonicalRecord {
        let doi = present(self.doi.map(|d| normalize::strip_doi_prefix(&d)));
        let native_id = present(self.native_id);
        let publication_date = present(self.publication_date);
        let year = self
            .publication_year
            .or_else(|| publication_date.as_deref().and_then(normalize::year_of));
        let year_text = year
            .map(|y| y.to_string())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        let joined: Vec<&str> = self
            .authors
            .iter()
            .map(|a| a.full.trim())
            .filter(|n| !n.is_empty())
            .collect();
        let authors = if joined.is_empty() {
            NOT_AVAILABLE.to_string()
        } else {
            joined.join(", ")
        };

        let id = doi
            .clone()
            .or_else(|| native_id.clone())
            .unwrap_or_else(|| query_url.to_string());
        let download_url = normalize::download_url(self.pdf_url.as_deref(), doi.as_deref());

        CanonicalRecord {
            id,
            authors,
            authors_year: normalize::authors_year(&self.authors, &year_text),
            title: or_na(self.title),
            journal: or_na(self.journal),
            publication_year: year_text,
            publication_date: publication_date.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            abstract_text: or_na(self.abstract_text),
            doi: doi.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            language: or_na(self.language),
            is_accepted: normalize::yes_no(self.is_accepted).to_string(),
            is_published: normalize::yes_no(self.is_published).to_string(),
            type_label: or_na(self.type_label),
            type_crossref: or_na(self.type_crossref),
            indexed_in: present(self.indexed_in)
                .unwrap_or_else(|| source.index_name().to_string()),
            is_open_access: normalize::yes_no(self.is_open_access).to_string(),
            oa_status: or_na(self.oa_status),
            download_url,
            cited_by_count: self
                .cited_by_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            api: source.tag().to_string(),
        }
    }
}

/// Collapse whitespace and drop empty or sentinel values.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| normalize::collapse_whitespace(&v))
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(NOT_AVAILABLE))
}

fn or_na(value: Option<String>) -> String {
    present(value).unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_draft_is_all_sentinels() {
        let rec = RecordDraft::default().build(Source::Plos, "https://api.plos.org/search?q=x");
        assert_eq!(rec.id(), "https://api.plos.org/search?q=x");
        assert_eq!(rec.authors(), "N/A");
        assert_eq!(rec.authors_year(), "Unknown N/A");
        assert_eq!(rec.download_url(), "N/A");
        assert_eq!(rec.is_open_access(), "N/A");
        assert_eq!(rec.indexed_in(), "PLOS");
        assert_eq!(rec.api(), "plos");
        assert!(rec.values().iter().all(|v| !v.is_empty()));
    }

    #[test]
    fn test_doi_drives_id_and_download_url() {
        let draft = RecordDraft {
            native_id: Some("W42".into()),
            doi: Some("https://doi.org/10.1000/xyz".into()),
            ..Default::default()
        };
        let rec = draft.build(Source::OpenAlex, "q");
        assert_eq!(rec.doi(), "10.1000/xyz");
        assert_eq!(rec.id(), "10.1000/xyz");
        assert_eq!(rec.download_url(), "https://doi.org/10.1000/xyz");
    }

    #[test]
    fn test_native_pdf_wins_over_doi() {
        let draft = RecordDraft {
            doi: Some("10.1/a".into()),
            pdf_url: Some("https://example.org/a.pdf".into()),
            ..Default::default()
        };
        let rec = draft.build(Source::Crossref, "q");
        assert_eq!(rec.download_url(), "https://example.org/a.pdf");
    }

    #[test]
    fn test_native_id_used_without_doi() {
        let draft = RecordDraft {
            native_id: Some("http://arxiv.org/abs/2301.12345v1".into()),
            ..Default::default()
        };
        assert_eq!(draft.build(Source::Arxiv, "q").id(), "http://arxiv.org/abs/2301.12345v1");
    }

    #[test]
    fn test_year_falls_back_to_date_and_flags_render() {
        let draft = RecordDraft {
            authors: vec![AuthorName::new("Jane Doe")],
            publication_date: Some("2021-03".into()),
            is_published: Some(true),
            is_open_access: Some(false),
            cited_by_count: Some(7),
            ..Default::default()
        };
        let rec = draft.build(Source::Scopus, "q");
        assert_eq!(rec.publication_year(), "2021");
        assert_eq!(rec.authors_year(), "Doe 2021");
        assert_eq!(rec.is_published(), "Yes");
        assert_eq!(rec.is_open_access(), "No");
        assert_eq!(rec.cited_by_count(), "7");
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("Springer".parse::<Source>(), Ok(Source::SpringerNature));
        assert_eq!(" PubMed ".parse::<Source>(), Ok(Source::PubMed));
        assert!("wos".parse::<Source>().is_err());
        for s in Source::ALL {
            assert_eq!(s.tag().parse::<Source>(), Ok(s));
        }
    }

    #[test]
    fn test_serialized_columns_follow_layout() {
        let rec = RecordDraft::default().build(Source::Ieee, "q");
        let json = serde_json::to_value(&rec).unwrap();
        let obj = json.as_object().unwrap();
        for col in CanonicalRecord::COLUMNS {
            assert!(obj.contains_key(col), "missing {}", col);
        }
    }
}
