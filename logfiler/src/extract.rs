//! Text extraction for discovered pages and documents.

use chrono::NaiveDate;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::document::{self, sniff, DocumentKind};
use crate::error::ExtractionError;
use crate::exclusion;
use crate::record::FileType;
use common::PolitenessConfig;

/// Below this many characters the readability result is treated as a miss.
const MIN_READABLE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    /// Date the page itself claims to be published or updated
    pub page_date: Option<NaiveDate>,
}

#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str, filetype: FileType) -> Result<Extraction, ExtractionError>;
}

/// Landing page of a `/download` link: the same url without the suffix.
pub fn landing_page_url(url: &str) -> Option<String> {
    let mut parsed = url::Url::parse(url).ok()?;
    let path = parsed.path().trim_end_matches('/').to_string();
    let landing = path.strip_suffix("/download")?;
    if landing.is_empty() {
        return None;
    }
    parsed.set_path(landing);
    parsed.set_query(None);
    Some(parsed.to_string())
}

/// Fetches over HTTP and extracts readable text plus a claimed date.
pub struct HttpExtractor {
    client: Client,
    max_response_bytes: u64,
}

impl HttpExtractor {
    pub fn new(politeness: &PolitenessConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(politeness.fetch_timeout_seconds()))
            .user_agent(politeness.user_agent())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build reqwest client: {}", e))?;
        Ok(Self {
            client,
            max_response_bytes: politeness.max_response_bytes(),
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ExtractionError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status(status.as_u16()));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_response_bytes {
                return Err(ExtractionError::Unsupported(format!(
                    "response of {} bytes exceeds limit",
                    len
                )));
            }
        }

        let bytes = response.bytes().await?;
        if bytes.len() as u64 > self.max_response_bytes {
            return Err(ExtractionError::Unsupported(format!(
                "response of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }

    async fn extract_html(&self, url: &str) -> Result<Extraction, ExtractionError> {
        let bytes = self.fetch(url).await?;
        let html = String::from_utf8_lossy(&bytes);
        let page_date = find_page_date(&html);
        let text = html_to_text(&html, url);
        if text.trim().is_empty() {
            return Err(ExtractionError::Empty);
        }
        Ok(Extraction { text, page_date })
    }

    /// Documents are described by their landing page when there is one, followed by
    /// the text of the document itself.
    async fn extract_document(&self, url: &str) -> Result<Extraction, ExtractionError> {
        let mut parts: Vec<String> = Vec::new();
        let mut page_date = None;

        if let Some(landing) = landing_page_url(url) {
            match self.fetch(&landing).await {
                Ok(bytes) => {
                    let html = String::from_utf8_lossy(&bytes);
                    page_date = find_landing_page_date(&html).or_else(|| find_page_date(&html));
                    let text = html_to_text(&html, &landing);
                    if !text.trim().is_empty() {
                        parts.push(text);
                    }
                }
                Err(e) => warn!("extract: landing page {} failed: {}", landing, e),
            }
        }

        let body = match self.fetch(url).await {
            Ok(bytes) => self.body_text(url, bytes).await,
            Err(e) => Err(e),
        };
        match body {
            Ok(text) => parts.push(text),
            Err(e) if parts.is_empty() => return Err(e),
            Err(e) => debug!("extract: body of {} not used, landing page only: {}", url, e),
        }

        Ok(Extraction {
            text: parts.join("\n\n"),
            page_date,
        })
    }

    async fn body_text(&self, url: &str, bytes: Vec<u8>) -> Result<String, ExtractionError> {
        if sniff(&bytes) == DocumentKind::Text {
            let body = String::from_utf8_lossy(&bytes);
            if looks_like_html(&body) {
                let text = html_to_text(&body, url);
                if text.trim().is_empty() {
                    return Err(ExtractionError::Empty);
                }
                return Ok(text);
            }
        }
        document::document_text(bytes).await
    }
}

#[async_trait::async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self, url: &str, filetype: FileType) -> Result<Extraction, ExtractionError> {
        let extraction = match filetype {
            FileType::Html => self.extract_html(url).await?,
            FileType::Pdf | FileType::Docx | FileType::Document | FileType::Other => {
                self.extract_document(url).await?
            }
        };
        info!(
            "extract: {} chars from {} ({})",
            extraction.text.len(),
            url,
            filetype
        );
        Ok(extraction)
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(256).collect::<String>().to_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("<body")
}

/// Main content of an HTML page as wrapped plain text.
///
/// Readability first; if it yields next to nothing, the first matching content
/// container, and finally all paragraphs.
pub fn html_to_text(html: &str, url: &str) -> String {
    let readable = readable_text(html, url).unwrap_or_default();
    if readable.trim().len() >= MIN_READABLE_CHARS {
        return readable;
    }

    let fallback = selector_text(html);
    if fallback.trim().len() > readable.trim().len() {
        fallback
    } else {
        readable
    }
}

fn readable_text(html: &str, url: &str) -> Option<String> {
    let url_obj = url::Url::parse(url).ok()?;
    let mut reader = Cursor::new(html.as_bytes());
    match readability::extractor::extract(&mut reader, &url_obj) {
        Ok(product) => match html2text::from_read(product.content.as_bytes(), 80) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("extract: failed to convert readable HTML to text: {}", e);
                Some(product.text)
            }
        },
        Err(e) => {
            debug!("extract: readability failed for {}: {}", url, e);
            None
        }
    }
}

fn selector_text(html: &str) -> String {
    let document = Html::parse_document(html);

    let selectors = ["main", "article", ".ma__rich-text", ".page-content", "#content"];
    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                if let Ok(text) = html2text::from_read(element.html().as_bytes(), 80) {
                    if !text.trim().is_empty() {
                        return text;
                    }
                }
            }
        }
    }

    let mut paragraphs = String::new();
    if let Ok(p_selector) = Selector::parse("p") {
        for element in document.select(&p_selector) {
            paragraphs.push_str(&element.html());
            paragraphs.push('\n');
        }
    }
    if paragraphs.is_empty() {
        return String::new();
    }
    html2text::from_read(paragraphs.as_bytes(), 80).unwrap_or_default()
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a date as written on a page: ISO/RFC 3339 prefix first, then prose dates.
pub fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some(prefix) = raw.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
    }
    exclusion::find_dates(raw).into_iter().next()
}

/// Publication date claimed by a regular page, from the usual metadata spots.
pub fn find_page_date(html: &str) -> Option<NaiveDate> {
    let document = Html::parse_document(html);

    if let Ok(selector) = Selector::parse(r#"meta[property="article:published_time"]"#) {
        let found = document
            .select(&selector)
            .filter_map(|e| e.value().attr("content"))
            .find_map(parse_loose_date);
        if found.is_some() {
            return found;
        }
    }

    for selector_str in [".ma__press-status__date", ".ma-page-header__published-date"] {
        if let Ok(selector) = Selector::parse(selector_str) {
            let found = document.select(&selector).find_map(|e| {
                let text = element_text(e);
                parse_loose_date(text.trim_start_matches("Published on "))
            });
            if found.is_some() {
                return found;
            }
        }
    }

    if let Ok(selector) = Selector::parse("time[datetime]") {
        return document
            .select(&selector)
            .filter_map(|e| e.value().attr("datetime"))
            .find_map(parse_loose_date);
    }

    None
}

/// "Last updated" date from a document landing page (table row or definition list).
pub fn find_landing_page_date(html: &str) -> Option<NaiveDate> {
    let document = Html::parse_document(html);

    if let (Ok(rows), Ok(th), Ok(td)) = (
        Selector::parse("tr"),
        Selector::parse("th"),
        Selector::parse("td"),
    ) {
        for row in document.select(&rows) {
            let is_label = row
                .select(&th)
                .any(|h| element_text(h).to_lowercase().contains("last updated"));
            if !is_label {
                continue;
            }
            if let Some(date) = row.select(&td).find_map(|d| parse_loose_date(&element_text(d))) {
                return Some(date);
            }
        }
    }

    if let Ok(terms) = Selector::parse("dt, dd") {
        let mut after_label = false;
        for element in document.select(&terms) {
            let text = element_text(element);
            match element.value().name() {
                "dt" => after_label = text.to_lowercase().contains("last updated"),
                "dd" if after_label => {
                    if let Some(date) = parse_loose_date(&text) {
                        return Some(date);
                    }
                    after_label = false;
                }
                _ => {}
            }
        }
    }

    None
}
