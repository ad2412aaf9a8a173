//! Text extraction from downloaded document bodies: PDF, Word (DOCX), spreadsheets
//! (XLSX, XLS, ODS) and plain text such as CSV.

use calamine::Reader;
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use tracing::debug;

use crate::error::ExtractionError;

/// What a downloaded document turned out to be, judged by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    /// DOCX, XLSX and other ZIP containers
    Zip,
    /// Legacy Office (XLS, DOC)
    Ole,
    Text,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Zip => "zip",
            DocumentKind::Ole => "ole",
            DocumentKind::Text => "text",
        };
        f.write_str(name)
    }
}

pub fn sniff(bytes: &[u8]) -> DocumentKind {
    if bytes.starts_with(b"%PDF") {
        DocumentKind::Pdf
    } else if bytes.starts_with(b"PK\x03\x04") {
        DocumentKind::Zip
    } else if bytes.starts_with(b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1") {
        DocumentKind::Ole
    } else {
        DocumentKind::Text
    }
}

fn unreadable(kind: &str, e: impl std::fmt::Display) -> ExtractionError {
    ExtractionError::Unsupported(format!("unreadable {}: {}", kind, e))
}

/// Plain text of a document body. Parsing is CPU bound and some parsers panic on
/// malformed input, so it runs on the blocking pool.
pub async fn document_text(bytes: Vec<u8>) -> Result<String, ExtractionError> {
    let kind = sniff(&bytes);
    let text = tokio::task::spawn_blocking(move || extract_sync(kind, &bytes))
        .await
        .map_err(|e| unreadable(&kind.to_string(), e))??;

    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ExtractionError::Empty);
    }
    debug!("document: {} chars of {} text", text.len(), kind);
    Ok(text)
}

fn extract_sync(kind: DocumentKind, bytes: &[u8]) -> Result<String, ExtractionError> {
    match kind {
        DocumentKind::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|e| unreadable("pdf", e)),
        DocumentKind::Zip => match docx_text(bytes) {
            Ok(text) => Ok(text),
            Err(docx_err) => {
                debug!("document: not a word document ({}), trying spreadsheet", docx_err);
                spreadsheet_text(bytes)
            }
        },
        DocumentKind::Ole => spreadsheet_text(bytes),
        DocumentKind::Text => Ok(decode_text(bytes)),
    }
}

/// UTF-8 when valid, otherwise Latin-1.
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Paragraph text of `word/document.xml`, one line per paragraph.
pub fn docx_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| unreadable("docx", e))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| unreadable("docx", e))?
        .read_to_string(&mut xml)
        .map_err(|e| unreadable("docx", e))?;

    let mut reader = quick_xml::Reader::from_str(&xml);
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => out.push('\t'),
                b"w:br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| unreadable("docx", e))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(unreadable("docx", e)),
            _ => {}
        }
    }
    Ok(out)
}

/// Every sheet as tab-separated rows under a `## <sheet>` line.
pub fn spreadsheet_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut workbook =
        calamine::open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| unreadable("spreadsheet", e))?;

    let mut out = String::new();
    for name in workbook.sheet_names().to_owned() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                debug!("document: sheet {} unreadable: {}", name, e);
                continue;
            }
        };
        out.push_str(&format!("## {}\n", name));
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out.push('\n');
    }
    Ok(out)
}
