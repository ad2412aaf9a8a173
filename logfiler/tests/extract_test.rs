use chrono::NaiveDate;
use common::PolitenessConfig;
use logfiler::error::ExtractionError;
use logfiler::extract::{Extractor, HttpExtractor};
use logfiler::record::FileType;
use std::io::{Cursor, Write};

const PRESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Grant applications open for coastal resilience</title>
  <meta property="article:published_time" content="2025-10-09T10:30:00-04:00">
</head>
<body>
  <nav><a href="/">Home</a> <a href="/news">News</a></nav>
  <main>
    <h1>Grant applications open for coastal resilience</h1>
    <p>The Executive Office of Energy and Environmental Affairs announced that grant applications
    are now open for municipalities seeking funding for coastal resilience projects this year.</p>
    <p>Eligible communities may apply for planning and construction grants. Applications are due
    by the end of the calendar year, and awards will be announced in the spring.</p>
    <p>Technical assistance sessions will be held online for interested applicants across the
    Commonwealth, with recordings posted afterwards for those unable to attend.</p>
  </main>
  <footer>Contact us</footer>
</body>
</html>"#;

const LANDING_PAGE: &str = r#"<html><body>
  <main>
    <h1>Annual water quality report</h1>
    <p>Summary of drinking water testing results reported by public water systems.</p>
    <table>
      <tr><th>Date published:</th><td>January 5, 2024</td></tr>
      <tr><th>Last updated:</th><td>October 9, 2025</td></tr>
    </table>
  </main>
</body></html>"#;

/// Single-page PDF with one line of Helvetica text and a correct xref table.
fn pdf_with_text(text: &str) -> Vec<u8> {
    let stream = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET", text);
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>".to_string(),
        format!("<< /Length {} >>\nstream\n{}\nendstream", stream.len(), stream),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>".to_string(),
    ];

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref_at = pdf.len();
    let mut tail = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for offset in offsets {
        tail.push_str(&format!("{:010} 00000 n \n", offset));
    }
    tail.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref_at
    ));
    pdf.extend_from_slice(tail.as_bytes());
    pdf
}

fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

fn politeness() -> PolitenessConfig {
    PolitenessConfig {
        fetch_timeout_seconds: Some(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_extracts_html_page_with_date() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/news/grants")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(PRESS_PAGE)
        .create_async()
        .await;

    let extractor = HttpExtractor::new(&politeness()).expect("extractor");
    let extraction = extractor
        .extract(&format!("{}/news/grants", server.url()), FileType::Html)
        .await
        .expect("extract");

    assert!(extraction.text.contains("coastal resilience"));
    assert_eq!(extraction.page_date, NaiveDate::from_ymd_opt(2025, 10, 9));
}

#[tokio::test]
async fn test_http_error_is_reported_with_status() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/missing")
        .with_status(404)
        .create_async()
        .await;

    let extractor = HttpExtractor::new(&politeness()).expect("extractor");
    let err = extractor
        .extract(&format!("{}/missing", server.url()), FileType::Html)
        .await
        .unwrap_err();
    assert_eq!(err, ExtractionError::Status(404));
}

#[tokio::test]
async fn test_download_described_by_landing_page() {
    let mut server = mockito::Server::new_async().await;
    let _landing = server
        .mock("GET", "/doc/water-report")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(LANDING_PAGE)
        .create_async()
        .await;
    let _download = server
        .mock("GET", "/doc/water-report/download")
        .with_status(200)
        .with_header("content-type", "application/pdf")
        .with_body("%PDF-1.7 binary content")
        .create_async()
        .await;

    let extractor = HttpExtractor::new(&politeness()).expect("extractor");
    let extraction = extractor
        .extract(
            &format!("{}/doc/water-report/download", server.url()),
            FileType::Document,
        )
        .await
        .expect("extract");

    assert!(extraction.text.contains("water"));
    assert!(!extraction.text.contains("%PDF"));
    assert_eq!(extraction.page_date, NaiveDate::from_ymd_opt(2025, 10, 9));
}

#[tokio::test]
async fn test_binary_document_without_landing_page_is_unsupported() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/files/data.pdf")
        .with_status(200)
        .with_body("%PDF-1.4 binary content")
        .create_async()
        .await;

    let extractor = HttpExtractor::new(&politeness()).expect("extractor");
    let err = extractor
        .extract(&format!("{}/files/data.pdf", server.url()), FileType::Pdf)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractionError::Unsupported(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_pdf_text_is_extracted_without_landing_page() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/files/report.pdf")
        .with_status(200)
        .with_header("content-type", "application/pdf")
        .with_body(pdf_with_text("Quarterly budget report"))
        .create_async()
        .await;

    let extractor = HttpExtractor::new(&politeness()).expect("extractor");
    let extraction = extractor
        .extract(&format!("{}/files/report.pdf", server.url()), FileType::Pdf)
        .await
        .expect("extract");

    assert!(extraction.text.contains("Quarterly"), "got: {}", extraction.text);
    assert!(extraction.text.contains("budget"), "got: {}", extraction.text);
    assert_eq!(extraction.page_date, None);
}

#[tokio::test]
async fn test_docx_text_follows_landing_page() {
    let mut server = mockito::Server::new_async().await;
    let _landing = server
        .mock("GET", "/doc/hearing-notice")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(LANDING_PAGE)
        .create_async()
        .await;
    let _download = server
        .mock("GET", "/doc/hearing-notice/download")
        .with_status(200)
        .with_header(
            "content-type",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        )
        .with_body(docx_with_paragraphs(&["Notice of public hearing", "Comments due November 1"]))
        .create_async()
        .await;

    let extractor = HttpExtractor::new(&politeness()).expect("extractor");
    let extraction = extractor
        .extract(
            &format!("{}/doc/hearing-notice/download", server.url()),
            FileType::Document,
        )
        .await
        .expect("extract");

    let landing_at = extraction.text.find("water").expect("landing page text");
    let body_at = extraction
        .text
        .find("Notice of public hearing\nComments due November 1")
        .expect("document text");
    assert!(landing_at < body_at);
    assert_eq!(extraction.page_date, NaiveDate::from_ymd_opt(2025, 10, 9));
}

#[tokio::test]
async fn test_oversized_response_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/big")
        .with_status(200)
        .with_body("x".repeat(4096))
        .create_async()
        .await;

    let config = PolitenessConfig {
        max_response_bytes: Some(1024),
        ..politeness()
    };
    let extractor = HttpExtractor::new(&config).expect("extractor");
    let err = extractor
        .extract(&format!("{}/big", server.url()), FileType::Html)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractionError::Unsupported(_)), "got {:?}", err);
}
