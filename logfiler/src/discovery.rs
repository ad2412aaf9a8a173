//! Discovery of the pages changed on a given date: the daily change list (CSV of
//! `loc,lastmod`) and, for news, RSS/Atom feeds.

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate};
use feed_rs::model::Feed;
use feed_rs::parser;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

use crate::record::DiscoveredPage;
use common::DiscoveryConfig;

pub struct Discovery {
    client: Client,
    changes_url_format: Option<String>,
    news_feeds: Vec<String>,
}

impl Discovery {
    pub fn new(config: &DiscoveryConfig, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_seconds.unwrap_or(30)))
            .user_agent(user_agent)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            client,
            changes_url_format: config.changes_url_format.clone(),
            news_feeds: config.news_feeds.clone(),
        })
    }

    /// All pages for the partition. `news_only` consults the feeds alone.
    pub async fn discover(&self, partition: NaiveDate, news_only: bool) -> Result<Vec<DiscoveredPage>> {
        let mut pages = Vec::new();

        if !news_only {
            let Some(format) = &self.changes_url_format else {
                bail!("discovery.changes_url_format is not configured (use --news-only for feeds alone)");
            };
            let url = change_list_url(format, partition);
            let body = fetch_with_retries(&self.client, &url)
                .await
                .with_context(|| format!("failed to fetch change list {}", url))?;
            let listed = parse_change_list(&String::from_utf8_lossy(&body));
            info!("Change list {} has {} entries", url, listed.len());
            pages.extend(listed);
        }

        if news_only || !self.news_feeds.is_empty() {
            let news = self.fetch_feed_pages(partition).await;
            match news {
                Ok(news) => pages.extend(news),
                Err(e) if news_only => return Err(e),
                Err(e) => warn!("News feeds unavailable: {:#}", e),
            }
        }

        Ok(pages)
    }

    /// Feed entries published or updated since the day before the partition date.
    pub async fn fetch_feed_pages(&self, partition: NaiveDate) -> Result<Vec<DiscoveredPage>> {
        if self.news_feeds.is_empty() {
            bail!("no news feeds configured (discovery.news_feeds)");
        }

        let since = partition - ChronoDuration::days(1);
        let mut pages = Vec::new();
        let mut failures = 0;
        for feed_url in &self.news_feeds {
            match fetch_and_parse_feed(&self.client, feed_url).await {
                Ok(feed) => {
                    let entries = feed_pages(&feed, since);
                    info!("Feed {} contributed {} entries", feed_url, entries.len());
                    pages.extend(entries);
                }
                Err(e) => {
                    warn!("Feed {} failed: {:#}", feed_url, e);
                    failures += 1;
                }
            }
        }

        if failures == self.news_feeds.len() {
            bail!("all {} news feeds failed", failures);
        }
        Ok(pages)
    }
}

/// Fill the `{date}` placeholder with `YYYY-MM-DD`.
pub fn change_list_url(format: &str, partition: NaiveDate) -> String {
    format.replace("{date}", &partition.format("%Y-%m-%d").to_string())
}

/// Parse the change list. The header row names the `loc` and `lastmod` columns; a
/// missing header means `loc,lastmod` order. Rows without an http(s) url are skipped.
pub fn parse_change_list(body: &str) -> Vec<DiscoveredPage> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut rows = reader.records().filter_map(|row| match row {
        Ok(row) => Some(row),
        Err(e) => {
            warn!("Skipping malformed change list row: {}", e);
            None
        }
    });
    let (mut loc_idx, mut lastmod_idx) = (0usize, Some(1usize));
    let mut pending = None;

    if let Some(first) = rows.next() {
        let headers: Vec<String> = first.iter().map(|h| h.to_lowercase()).collect();
        if let Some(idx) = headers.iter().position(|h| h == "loc" || h == "url") {
            loc_idx = idx;
            lastmod_idx = headers.iter().position(|h| h == "lastmod");
        } else {
            pending = Some(first);
        }
    }

    pending
        .into_iter()
        .chain(rows)
        .filter_map(|row| {
            let url = row.get(loc_idx)?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return None;
            }
            let lastmodified = lastmod_idx
                .and_then(|i| row.get(i))
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(DiscoveredPage::new(url, lastmodified))
        })
        .collect()
}

/// Entries with a link whose date (updated, else published) is on or after `since`.
/// Undated entries are kept.
pub fn feed_pages(feed: &Feed, since: NaiveDate) -> Vec<DiscoveredPage> {
    feed.entries
        .iter()
        .filter_map(|entry| {
            let url = entry.links.first().map(|l| l.href.trim().to_string())?;
            if url.is_empty() {
                return None;
            }
            let stamp = entry.updated.or(entry.published);
            if let Some(stamp) = stamp {
                if stamp.date_naive() < since {
                    return None;
                }
            }
            Some(DiscoveredPage::new(url, stamp.map(|s| s.to_rfc3339())))
        })
        .collect()
}

async fn fetch_and_parse_feed(client: &Client, url: &str) -> Result<Feed> {
    let bytes = fetch_with_retries(client, url).await?;
    let feed = parser::parse(bytes.as_slice()).context("failed to parse feed")?;
    Ok(feed)
}

/// GET with up to three attempts. Server errors, 429 and network errors are retried
/// after 1s then 2s; other client errors fail at once.
async fn fetch_with_retries(client: &Client, url: &str) -> Result<Vec<u8>> {
    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        if attempt > 1 {
            let backoff = Duration::from_secs(2u64.pow(attempt - 2));
            info!("Retrying fetch for {} (attempt {}/{}) after {:?}...", url, attempt, max_retries, backoff);
            tokio::time::sleep(backoff).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let bytes = response.bytes().await.context("failed to read response body")?;
                    return Ok(bytes.to_vec());
                } else if status.is_server_error() {
                    last_error = Some(anyhow::anyhow!("server error: {}", status));
                } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    last_error = Some(anyhow::anyhow!("rate limited: {}", status));
                } else {
                    bail!("fetch failed with status: {}", status);
                }
            }
            Err(e) => {
                last_error = Some(anyhow::Error::new(e).context("network error during fetch"));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
}
