use chrono::NaiveDate;
use common::DiscoveryConfig;
use logfiler::discovery::Discovery;

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Press releases</title>
<item><title>New grants</title><link>https://www.mass.gov/news/new-grants</link><pubDate>Fri, 10 Oct 2025 14:00:00 GMT</pubDate></item>
<item><title>Last month</title><link>https://www.mass.gov/news/last-month</link><pubDate>Mon, 01 Sep 2025 14:00:00 GMT</pubDate></item>
</channel></rss>"#;

fn partition() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 10, 10).unwrap()
}

#[tokio::test]
async fn test_change_list_and_feeds_are_combined() {
    let mut server = mockito::Server::new_async().await;
    let _changes = server
        .mock("GET", "/changes/2025-10-10.csv")
        .with_status(200)
        .with_body("loc,lastmod\nhttps://www.mass.gov/info/a,2025-10-10T08:00:00-04:00\nhttps://www.mass.gov/doc/b/download,2025-10-10T09:00:00-04:00\n")
        .create_async()
        .await;
    let _feed = server
        .mock("GET", "/rss")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(FEED)
        .create_async()
        .await;

    let config = DiscoveryConfig {
        changes_url_format: Some(format!("{}/changes/{{date}}.csv", server.url())),
        news_feeds: vec![format!("{}/rss", server.url())],
        fetch_timeout_seconds: Some(5),
    };
    let discovery = Discovery::new(&config, "logfiler-test").expect("discovery");

    let pages = discovery.discover(partition(), false).await.expect("discover");
    let urls: Vec<&str> = pages.iter().map(|p| p.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://www.mass.gov/info/a",
            "https://www.mass.gov/doc/b/download",
            "https://www.mass.gov/news/new-grants",
        ]
    );

    let news = discovery.discover(partition(), true).await.expect("news only");
    assert_eq!(news.len(), 1);
}

#[tokio::test]
async fn test_missing_change_list_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    let _changes = server
        .mock("GET", "/changes/2025-10-10.csv")
        .with_status(404)
        .create_async()
        .await;

    let config = DiscoveryConfig {
        changes_url_format: Some(format!("{}/changes/{{date}}.csv", server.url())),
        news_feeds: Vec::new(),
        fetch_timeout_seconds: Some(5),
    };
    let discovery = Discovery::new(&config, "logfiler-test").expect("discovery");
    assert!(discovery.discover(partition(), false).await.is_err());
}
