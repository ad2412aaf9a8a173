//! Record model: one URL's state within a date partition.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Detected content kind of a discovered URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Html,
    Pdf,
    Docx,
    /// A `/download` link whose format is only known after fetching it
    Document,
    Other,
}

impl FileType {
    /// Guess the file type from the URL shape alone.
    pub fn from_url(url: &str) -> Self {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_lowercase())
            .unwrap_or_else(|_| url.to_lowercase());
        if path.ends_with(".pdf") {
            FileType::Pdf
        } else if path.ends_with(".docx") || path.ends_with(".doc") {
            FileType::Docx
        } else if path.ends_with("/download") {
            FileType::Document
        } else if path.ends_with(".xlsx")
            || path.ends_with(".xls")
            || path.ends_with(".csv")
            || path.ends_with(".zip")
        {
            FileType::Other
        } else {
            FileType::Html
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Html => "html",
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Document => "document",
            FileType::Other => "other",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "html" => Ok(FileType::Html),
            "pdf" => Ok(FileType::Pdf),
            "docx" | "doc" => Ok(FileType::Docx),
            "document" => Ok(FileType::Document),
            "other" => Ok(FileType::Other),
            other => Err(format!("unknown file type: {}", other)),
        }
    }
}

/// Classification outcome. Unset is represented by `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Newness {
    New,
    Maybe,
    NotNew,
}

impl Newness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Newness::New => "new",
            Newness::Maybe => "maybe",
            Newness::NotNew => "not_new",
        }
    }
}

impl FromStr for Newness {
    type Err = String;

    /// Lenient: backends answer with `yes`/`no` about as often as with the canonical names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "new" | "yes" | "true" => Ok(Newness::New),
            "maybe" | "unknown" => Ok(Newness::Maybe),
            "not_new" | "no" | "false" | "old" => Ok(Newness::NotNew),
            other => Err(format!("unknown is_new value: {}", other)),
        }
    }
}

/// Who excluded a record. Unset is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exclusion {
    /// Set by an administrator. Automation never changes it.
    Manual,
    /// Set by the staleness check.
    Automatic,
}

impl Exclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exclusion::Manual => "manual",
            Exclusion::Automatic => "automatic",
        }
    }
}

impl FromStr for Exclusion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(Exclusion::Manual),
            // rows written before the manual/automatic split only said "yes"
            "automatic" | "yes" => Ok(Exclusion::Automatic),
            other => Err(format!("unknown exclusion value: {}", other)),
        }
    }
}

/// Marker left on a record whose classification did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifyFailure {
    /// Backend unavailable; picked up again by the next classify pass.
    Transient,
    /// Backend answered unusably; only retry-classify selects it again.
    Parse,
}

impl ClassifyFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifyFailure::Transient => "transient",
            ClassifyFailure::Parse => "parse",
        }
    }
}

impl FromStr for ClassifyFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "transient" => Ok(ClassifyFailure::Transient),
            "parse" => Ok(ClassifyFailure::Parse),
            other => Err(format!("unknown failure marker: {}", other)),
        }
    }
}

/// Processing state, derived from which fields are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Discovered,
    ScrapeFailed,
    Scraped,
    ClassificationFailed,
    ParseFailed,
    Classified,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Discovered => "discovered",
            ProcessingState::ScrapeFailed => "scrape-failed",
            ProcessingState::Scraped => "scraped",
            ProcessingState::ClassificationFailed => "classification-failed",
            ProcessingState::ParseFailed => "parse-failed",
            ProcessingState::Classified => "classified",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered `(url, lastmodified, filetype)` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPage {
    pub url: String,
    pub lastmodified: Option<String>,
    pub filetype: FileType,
}

impl DiscoveredPage {
    pub fn new(url: impl Into<String>, lastmodified: Option<String>) -> Self {
        let url = url.into();
        let filetype = FileType::from_url(&url);
        Self {
            url,
            lastmodified,
            filetype,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: NaiveDate,
    pub url: String,

    // scrape field group
    pub lastmodified: Option<String>,
    pub filetype: FileType,
    pub extracted_text: Option<String>,
    pub source_text_hash: Option<String>,
    pub page_date: Option<NaiveDate>,
    pub scrape_error: Option<String>,
    pub scrape_attempts: u32,

    // classification field group
    pub is_new: Option<Newness>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub classified_hash: Option<String>,
    pub classify_failure: Option<ClassifyFailure>,
    pub classify_error: Option<String>,
    pub classify_attempts: u32,

    // exclusion field group
    pub excluded: Option<Exclusion>,
    pub exclusion_reason: Option<String>,

    pub discovered_at: DateTime<Utc>,
}

impl Record {
    pub fn state(&self) -> ProcessingState {
        if self.scrape_error.is_some() {
            return ProcessingState::ScrapeFailed;
        }
        if self.extracted_text.is_none() {
            return ProcessingState::Discovered;
        }
        if self.is_new.is_some() && self.classified_hash == self.source_text_hash {
            return ProcessingState::Classified;
        }
        match self.classify_failure {
            Some(ClassifyFailure::Transient) => ProcessingState::ClassificationFailed,
            Some(ClassifyFailure::Parse) => ProcessingState::ParseFailed,
            None => ProcessingState::Scraped,
        }
    }
}

/// SHA-256 fingerprint of extracted text, lowercase hex.
pub fn text_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filetype_from_url() {
        assert_eq!(
            FileType::from_url("https://www.mass.gov/doc/budget-brief/download"),
            FileType::Document
        );
        assert_eq!(
            FileType::from_url("https://www.mass.gov/files/report.PDF"),
            FileType::Pdf
        );
        assert_eq!(
            FileType::from_url("https://www.mass.gov/news/new-grants?x=1"),
            FileType::Html
        );
        assert_eq!(
            FileType::from_url("https://www.mass.gov/files/data.xlsx"),
            FileType::Other
        );
    }

    #[test]
    fn newness_is_lenient() {
        assert_eq!("yes".parse::<Newness>(), Ok(Newness::New));
        assert_eq!("Not New".parse::<Newness>(), Ok(Newness::NotNew));
        assert_eq!("maybe".parse::<Newness>(), Ok(Newness::Maybe));
        assert!("perhaps".parse::<Newness>().is_err());
    }

    #[test]
    fn legacy_yes_exclusion_reads_as_automatic() {
        assert_eq!("yes".parse::<Exclusion>(), Ok(Exclusion::Automatic));
        assert_eq!("manual".parse::<Exclusion>(), Ok(Exclusion::Manual));
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = text_hash("hello");
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(h, text_hash("hello"));
        assert_ne!(h, text_hash("hello "));
    }
}
