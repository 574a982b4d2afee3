//! Field-level normalization shared by every adapter.

use std::sync::LazyLock;

use quick_xml::escape::resolve_html5_entity;
use regex::{Captures, Regex};

use crate::record::NOT_AVAILABLE;

// Opening, closing or self-closing tag. Attributes need a value, so prose
// such as `n<m and k>2` is left alone.
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"</?[A-Za-z][\w:.-]*(?:\s+[\w:.-]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'<>]+))*\s*/?>"#)
        .expect("tag pattern")
});

static RE_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{1,31});").expect("entity pattern")
});

/// An author as the backend reports it. `family` is set when the API gives a
/// structured surname; otherwise the surname is derived from `full`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthorName {
    pub full: String,
    pub family: Option<String>,
}

impl AuthorName {
    pub fn new(full: impl Into<String>) -> Self {
        Self {
            full: full.into(),
            family: None,
        }
    }

    pub fn structured(given: Option<&str>, family: Option<&str>) -> Self {
        let given = given.unwrap_or("").trim();
        let family = family.map(str::trim).filter(|f| !f.is_empty());
        let full = format!("{} {}", given, family.unwrap_or("")).trim().to_string();
        Self {
            full,
            family: family.map(str::to_string),
        }
    }

    pub fn surname(&self) -> Option<&str> {
        match self.family.as_deref() {
            Some(f) if !f.trim().is_empty() => Some(f.trim()),
            _ => last_name(&self.full),
        }
    }
}

/// Surname of a free-form name: text before the first comma when one is
/// present ("Doe, J." style), the final whitespace token otherwise.
pub fn last_name(full: &str) -> Option<&str> {
    let full = full.trim();
    if full.is_empty() {
        return None;
    }
    if let Some((head, _)) = full.split_once(',') {
        let head = head.trim();
        return (!head.is_empty()).then_some(head);
    }
    full.split_whitespace().last()
}

/// Short citation label: `Doe 2020`, `Doe and Roe 2020`, `Doe et al. 2020`.
pub fn authors_year(authors: &[AuthorName], year: &str) -> String {
    if authors.is_empty() {
        return format!("Unknown {}", year);
    }
    let surnames: Vec<&str> = authors.iter().filter_map(AuthorName::surname).collect();
    match surnames.as_slice() {
        [] => year.to_string(),
        [only] => format!("{} {}", only, year),
        [first, second] => format!("{} and {} {}", first, second, year),
        [first, ..] => format!("{} et al. {}", first, year),
    }
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entity(caps: &Captures) -> String {
    let name = &caps[1];
    let decoded = match name.strip_prefix('#') {
        Some(num) => match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => num.parse().ok(),
        }
        .and_then(char::from_u32)
        .map(String::from),
        None => resolve_html5_entity(name).map(str::to_string),
    };
    decoded.unwrap_or_else(|| caps[0].to_string())
}

/// Drop markup tags, decode entities and collapse whitespace.
///
/// Repeats until nothing changes, so escaped markup (`&lt;i&gt;`) is removed
/// too and the result is a fixed point. Every pass that changes the text
/// shortens it.
pub fn strip_markup(raw: &str) -> String {
    let mut text = collapse_whitespace(raw);
    while text.contains('<') || text.contains('&') {
        let stripped = RE_TAG.replace_all(&text, "");
        let next = collapse_whitespace(&RE_ENTITY.replace_all(&stripped, decode_entity));
        if next == text {
            break;
        }
        text = next;
    }
    text
}

/// Abstract cleaner: markup-free, single-spaced, `N/A` when nothing is left.
/// Applying it to its own output is a no-op.
pub fn clean_abstract(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NOT_AVAILABLE) {
        return NOT_AVAILABLE.to_string();
    }
    let text = strip_markup(trimmed);
    if text.is_empty() {
        NOT_AVAILABLE.to_string()
    } else {
        text
    }
}

/// Month name, abbreviation or number to a two-digit string.
pub fn month_to_number(month: &str) -> Option<String> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let month = month.trim().trim_end_matches('.');
    if let Ok(n) = month.parse::<u32>() {
        return (1..=12).contains(&n).then(|| format!("{:02}", n));
    }
    let lower = month.to_lowercase();
    let prefix = lower.get(..3)?;
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|i| format!("{:02}", i + 1))
}

/// ISO partial date from loose components: `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
pub fn partial_date(year: Option<&str>, month: Option<&str>, day: Option<&str>) -> Option<String> {
    let year = year.map(str::trim).filter(|y| is_year(y))?;
    let Some(month) = month.and_then(month_to_number) else {
        return Some(year.to_string());
    };
    match day.and_then(|d| d.trim().parse::<u32>().ok()) {
        Some(d) if (1..=31).contains(&d) => Some(format!("{}-{}-{:02}", year, month, d)),
        _ => Some(format!("{}-{}", year, month)),
    }
}

/// Date from numeric parts as delivered by Crossref-style `date-parts`.
pub fn date_from_parts(parts: &[Option<i64>]) -> Option<String> {
    match parts {
        [Some(y), Some(m), Some(d), ..] => Some(format!("{:04}-{:02}-{:02}", y, m, d)),
        [Some(y), Some(m), ..] => Some(format!("{:04}-{:02}", y, m)),
        [Some(y), ..] => Some(format!("{:04}", y)),
        _ => None,
    }
}

/// First four-digit run in free text, e.g. a PubMed `MedlineDate`.
pub fn leading_year(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    bytes
        .windows(4)
        .enumerate()
        .find(|(i, w)| {
            w.iter().all(u8::is_ascii_digit)
                && (*i == 0 || !bytes[i - 1].is_ascii_digit())
                && bytes.get(i + 4).map_or(true, |b| !b.is_ascii_digit())
        })
        .map(|(i, _)| text[i..i + 4].to_string())
}

/// Year prefix of an ISO (partial) date.
pub fn year_of(date: &str) -> Option<i32> {
    let head = date.trim().get(..4)?;
    if is_year(head) {
        head.parse().ok()
    } else {
        None
    }
}

fn is_year(s: &str) -> bool {
    s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn strip_doi_prefix(raw: &str) -> String {
    let raw = raw.trim();
    for prefix in ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/", "doi:"] {
        if raw.get(..prefix.len()).is_some_and(|head| head.eq_ignore_ascii_case(prefix)) {
            return raw[prefix.len()..].trim().to_string();
        }
    }
    raw.to_string()
}

pub fn doi_url(doi: &str) -> String {
    format!("https://doi.org/{}", doi)
}

/// Native PDF link first, DOI resolver second.
pub fn download_url(pdf_url: Option<&str>, doi: Option<&str>) -> String {
    let usable = |v: &&str| !v.trim().is_empty() && !v.eq_ignore_ascii_case(NOT_AVAILABLE);
    if let Some(pdf) = pdf_url.filter(usable) {
        return pdf.trim().to_string();
    }
    doi.filter(usable)
        .map(|d| doi_url(d.trim()))
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

pub fn yes_no(flag: Option<bool>) -> &'static str {
    match flag {
        Some(true) => "Yes",
        Some(false) => "No",
        None => NOT_AVAILABLE,
    }
}
