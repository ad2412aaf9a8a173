//! Scrape Coordinator: fills the scrape field group of discovered records.

use anyhow::Result;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extract::Extractor;
use crate::record::{text_hash, DiscoveredPage, Record};
use crate::store::RecordStore;
use common::PolitenessConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeReport {
    pub discovered: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Outcome of one scrape task.
enum Scraped {
    Succeeded,
    Failed,
    Cancelled,
}

/// New urls, changed `lastmodified` and never-attempted records are scraped.
pub fn needs_scrape(existing: Option<&Record>, page: &DiscoveredPage) -> bool {
    match existing {
        None => true,
        Some(record) => record.scrape_attempts == 0 || record.lastmodified != page.lastmodified,
    }
}

pub struct ScrapeCoordinator {
    store: RecordStore,
    extractor: Arc<dyn Extractor>,
    concurrency: usize,
    delay_range_ms: (u64, u64),
    cancel: CancellationToken,
}

impl ScrapeCoordinator {
    pub fn new(
        store: RecordStore,
        extractor: Arc<dyn Extractor>,
        politeness: &PolitenessConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            extractor,
            concurrency: politeness.concurrency(),
            delay_range_ms: politeness.delay_range_ms(),
            cancel,
        }
    }

    /// Register every discovered page and scrape the ones that need it.
    pub async fn run(&self, partition: NaiveDate, pages: Vec<DiscoveredPage>) -> Result<ScrapeReport> {
        let mut report = ScrapeReport {
            discovered: pages.len(),
            ..Default::default()
        };

        // Last tuple wins for a repeated url.
        let unique: BTreeMap<String, DiscoveredPage> =
            pages.into_iter().map(|p| (p.url.clone(), p)).collect();

        let mut work = Vec::new();
        for page in unique.into_values() {
            let existing = self.store.get(partition, &page.url).await?;
            self.store.register(partition, &page).await?;
            if needs_scrape(existing.as_ref(), &page) {
                work.push(page);
            } else {
                report.skipped += 1;
            }
        }

        info!(
            "Scraping {} of {} unique urls for {} ({} unchanged)",
            work.len(),
            work.len() + report.skipped,
            partition,
            report.skipped
        );
        self.scrape_all(partition, work, &mut report).await?;
        Ok(report)
    }

    /// Scrape exactly these records again (retry path).
    pub async fn scrape_records(&self, partition: NaiveDate, records: Vec<Record>) -> Result<ScrapeReport> {
        let work: Vec<DiscoveredPage> = records
            .into_iter()
            .map(|r| DiscoveredPage {
                url: r.url,
                lastmodified: r.lastmodified,
                filetype: r.filetype,
            })
            .collect();
        let mut report = ScrapeReport {
            discovered: work.len(),
            ..Default::default()
        };
        self.scrape_all(partition, work, &mut report).await?;
        Ok(report)
    }

    async fn scrape_all(
        &self,
        partition: NaiveDate,
        work: Vec<DiscoveredPage>,
        report: &mut ScrapeReport,
    ) -> Result<()> {
        let outcomes: Vec<Result<Scraped>> = stream::iter(work)
            .map(|page| self.scrape_one(partition, page))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut cancelled = 0;
        for outcome in outcomes {
            match outcome? {
                Scraped::Succeeded => {
                    report.attempted += 1;
                    report.succeeded += 1;
                }
                Scraped::Failed => {
                    report.attempted += 1;
                    report.failed += 1;
                }
                Scraped::Cancelled => cancelled += 1,
            }
        }
        if cancelled > 0 {
            warn!("Scrape cancelled; {} urls left for a later run", cancelled);
        }
        Ok(())
    }

    async fn scrape_one(&self, partition: NaiveDate, page: DiscoveredPage) -> Result<Scraped> {
        if self.cancel.is_cancelled() {
            return Ok(Scraped::Cancelled);
        }

        let (min, max) = self.delay_range_ms;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Scraped::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        match self.extractor.extract(&page.url, page.filetype).await {
            Ok(extraction) => {
                let hash = text_hash(&extraction.text);
                self.store
                    .record_scrape_success(
                        partition,
                        &page.url,
                        page.lastmodified.as_deref(),
                        &extraction.text,
                        &hash,
                        extraction.page_date,
                    )
                    .await?;
                debug!(url = %page.url, "scraped");
                Ok(Scraped::Succeeded)
            }
            Err(e) => {
                warn!(url = %page.url, "scrape failed: {}", e);
                self.store
                    .record_scrape_failure(
                        partition,
                        &page.url,
                        page.lastmodified.as_deref(),
                        &e.to_string(),
                    )
                    .await?;
                Ok(Scraped::Failed)
            }
        }
    }
}
