//! Retry Controller: re-drives the scrape and classify stages for failed records only,
//! and reports per-state counts.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::classify::{ClassificationBatcher, ClassifyReport};
use crate::record::{Exclusion, ProcessingState, Record};
use crate::scrape::{ScrapeCoordinator, ScrapeReport};
use crate::store::{RecordStore, Selection};

/// Attempt caps after which a failure is permanent.
#[derive(Debug, Clone, Copy)]
pub struct AttemptCaps {
    pub scrape: u32,
    pub classify: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub url: String,
    pub state: ProcessingState,
    pub marker: String,
    pub attempts: u32,
    /// Attempt cap reached; not selected again automatically.
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub partition: NaiveDate,
    pub total: usize,
    pub by_state: BTreeMap<ProcessingState, usize>,
    pub excluded_manual: usize,
    pub excluded_automatic: usize,
    pub failures: Vec<FailureEntry>,
}

impl StatusReport {
    pub fn from_records(partition: NaiveDate, records: &[Record], caps: AttemptCaps) -> Self {
        let mut by_state = BTreeMap::new();
        let mut failures = Vec::new();
        let mut excluded_manual = 0;
        let mut excluded_automatic = 0;

        for record in records {
            let state = record.state();
            *by_state.entry(state).or_insert(0) += 1;

            match record.excluded {
                Some(Exclusion::Manual) => excluded_manual += 1,
                Some(Exclusion::Automatic) => excluded_automatic += 1,
                None => {}
            }

            let failure = match state {
                ProcessingState::ScrapeFailed => Some((
                    record.scrape_error.clone().unwrap_or_default(),
                    record.scrape_attempts,
                    caps.scrape,
                )),
                ProcessingState::ClassificationFailed | ProcessingState::ParseFailed => Some((
                    record.classify_error.clone().unwrap_or_default(),
                    record.classify_attempts,
                    caps.classify,
                )),
                _ => None,
            };
            if let Some((marker, attempts, cap)) = failure {
                failures.push(FailureEntry {
                    url: record.url.clone(),
                    state,
                    marker,
                    attempts,
                    permanent: attempts >= cap,
                });
            }
        }

        Self {
            partition,
            total: records.len(),
            by_state,
            excluded_manual,
            excluded_automatic,
            failures,
        }
    }

    pub fn count(&self, state: ProcessingState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Partition {}: {} records", self.partition, self.total)?;
        for (state, count) in &self.by_state {
            writeln!(f, "  {:<22} {}", state.as_str(), count)?;
        }
        writeln!(
            f,
            "  excluded: {} manual, {} automatic",
            self.excluded_manual, self.excluded_automatic
        )?;
        if !self.failures.is_empty() {
            writeln!(f, "Failures:")?;
            for failure in &self.failures {
                writeln!(
                    f,
                    "  [{}{}] {} (attempts: {}) {}",
                    failure.state,
                    if failure.permanent { ", permanent" } else { "" },
                    failure.url,
                    failure.attempts,
                    failure.marker
                )?;
            }
        }
        Ok(())
    }
}

pub struct RetryController<'a> {
    store: &'a RecordStore,
    scraper: &'a ScrapeCoordinator,
    batcher: &'a ClassificationBatcher,
    caps: AttemptCaps,
}

impl<'a> RetryController<'a> {
    pub fn new(
        store: &'a RecordStore,
        scraper: &'a ScrapeCoordinator,
        batcher: &'a ClassificationBatcher,
        caps: AttemptCaps,
    ) -> Self {
        Self {
            store,
            scraper,
            batcher,
            caps,
        }
    }

    /// Scrape-failed and never-attempted records below the cap, and nothing else.
    pub async fn retry_scrape(&self, partition: NaiveDate) -> Result<ScrapeReport> {
        let candidates = self
            .store
            .scrape_retry_candidates(partition, self.caps.scrape)
            .await?;
        info!("Retrying scrape for {} records of {}", candidates.len(), partition);
        self.scraper.scrape_records(partition, candidates).await
    }

    /// Records without a current classification, parse failures included.
    pub async fn retry_classify(&self, partition: NaiveDate) -> Result<ClassifyReport> {
        self.batcher.run(partition, Selection::Failed).await
    }

    pub async fn status(&self, partition: NaiveDate) -> Result<StatusReport> {
        let records = self.store.list(partition).await?;
        Ok(StatusReport::from_records(partition, &records, self.caps))
    }
}
