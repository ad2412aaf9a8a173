//! Classification Batcher: classifies scraped records through the flash tier and
//! applies the staleness check at write time.

use anyhow::Result;
use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::ProviderError;
use crate::exclusion::{self, OUTDATED_CATEGORY};
use crate::llm::{ClassifyRequest, ModelBackend};
use crate::record::{text_hash, ClassifyFailure, Record};
use crate::store::{ClassificationWrite, RecordStore, Selection};
use common::Config;

const EXCERPT_NOTE: &str =
    "[NOTE TO EDITOR: The following document was excerpted due to extreme length.]\n\n";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyReport {
    pub candidates: usize,
    pub classified: usize,
    pub transient_failures: usize,
    pub parse_failures: usize,
    pub auto_excluded: usize,
}

/// Per-batch packing limits for a rate tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_chars: usize,
}

/// Slow tiers get small batches so a single batch never waits minutes for its tokens.
pub fn batch_limits(rpm: u32) -> BatchLimits {
    if rpm <= 2 {
        BatchLimits {
            max_items: 1,
            max_chars: 40_000,
        }
    } else if rpm <= 10 {
        BatchLimits {
            max_items: 3,
            max_chars: 62_500,
        }
    } else {
        BatchLimits {
            max_items: 5,
            max_chars: 125_000,
        }
    }
}

fn text_len(record: &Record) -> usize {
    record.extracted_text.as_deref().map_or(0, str::len)
}

/// Largest documents first, packed under the item and character limits. A document
/// larger than the budget gets a batch of its own.
pub fn build_batches(mut records: Vec<Record>, limits: BatchLimits) -> Vec<Vec<Record>> {
    records.sort_by(|a, b| text_len(b).cmp(&text_len(a)).then_with(|| a.url.cmp(&b.url)));

    let mut batches = Vec::new();
    let mut current: Vec<Record> = Vec::new();
    let mut current_chars = 0;

    for record in records {
        let size = text_len(&record);
        let full = current.len() >= limits.max_items || current_chars + size > limits.max_chars;
        if full && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += size;
        current.push(record);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Cut `text` to `limit` characters, prefixed with an editor's note when cut.
pub fn truncate_for_model(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{}", EXCERPT_NOTE, &text[..cut]),
        None => text.to_string(),
    }
}

enum Outcome {
    Classified { auto_excluded: bool },
    Transient,
    Parse,
    Cancelled,
}

pub struct ClassificationBatcher {
    store: RecordStore,
    backend: Arc<dyn ModelBackend>,
    dispatcher: Arc<Dispatcher>,
    max_attempts: u32,
    truncation_length: usize,
    staleness_threshold_days: i64,
    cancel: CancellationToken,
}

impl ClassificationBatcher {
    pub fn new(
        store: RecordStore,
        backend: Arc<dyn ModelBackend>,
        dispatcher: Arc<Dispatcher>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            backend,
            dispatcher,
            max_attempts: config.llm.max_attempts(),
            truncation_length: config.llm.truncation_length(),
            staleness_threshold_days: config.pipeline.staleness_threshold_days(),
            cancel,
        }
    }

    /// Classify the selected candidates of a partition. The partition date is the
    /// reference date for staleness.
    pub async fn run(&self, partition: NaiveDate, selection: Selection) -> Result<ClassifyReport> {
        let candidates = self
            .store
            .classification_candidates(partition, selection, self.max_attempts)
            .await?;
        let mut report = ClassifyReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            info!("No records to classify for {}", partition);
            return Ok(report);
        }

        let batches = build_batches(candidates, batch_limits(self.dispatcher.rpm()));
        info!(
            "Classifying {} records for {} in {} batches ({} tier, {} rpm)",
            report.candidates,
            partition,
            batches.len(),
            self.dispatcher.tier(),
            self.dispatcher.rpm()
        );

        for (idx, batch) in batches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Classification cancelled before batch {}", idx + 1);
                break;
            }
            debug!("Batch {} with {} items", idx + 1, batch.len());

            let outcomes = join_all(batch.into_iter().map(|r| self.classify_one(partition, r))).await;
            for outcome in outcomes {
                match outcome? {
                    Outcome::Classified { auto_excluded } => {
                        report.classified += 1;
                        if auto_excluded {
                            report.auto_excluded += 1;
                        }
                    }
                    Outcome::Transient => report.transient_failures += 1,
                    Outcome::Parse => report.parse_failures += 1,
                    Outcome::Cancelled => {}
                }
            }
        }

        info!(
            "Classified {}/{} ({} transient, {} parse failures, {} auto-excluded)",
            report.classified,
            report.candidates,
            report.transient_failures,
            report.parse_failures,
            report.auto_excluded
        );
        Ok(report)
    }

    async fn classify_one(&self, partition: NaiveDate, record: Record) -> Result<Outcome> {
        if self.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let text = record.extracted_text.clone().unwrap_or_default();
        let hash = record
            .source_text_hash
            .clone()
            .unwrap_or_else(|| text_hash(&text));
        let request = ClassifyRequest {
            url: record.url.clone(),
            filetype: record.filetype,
            content: truncate_for_model(&text, self.truncation_length),
            run_date: partition,
        };

        let backend = &self.backend;
        let req = &request;
        let label = format!("classify {}", record.url);
        let result = self
            .dispatcher
            .call(&label, move || backend.classify(req))
            .await;

        let classification = match result {
            Ok(c) => c,
            Err(ProviderError::Transient(msg)) => {
                self.store
                    .record_classify_failure(partition, &record.url, ClassifyFailure::Transient, &msg)
                    .await?;
                return Ok(Outcome::Transient);
            }
            Err(ProviderError::Permanent(msg)) => {
                warn!(url = %record.url, "unusable classification: {}", msg);
                self.store
                    .record_classify_failure(partition, &record.url, ClassifyFailure::Parse, &msg)
                    .await?;
                return Ok(Outcome::Parse);
            }
        };

        let local = exclusion::stale_by_dates(
            &text,
            record.page_date,
            partition,
            self.staleness_threshold_days,
        );
        let stale = exclusion::is_stale(local, classification.is_stale);
        let merged = exclusion::merge(record.excluded, stale);
        let newly_excluded = merged != record.excluded;

        let reason = newly_excluded.then(|| match local {
            Some(true) => format!(
                "newest date in content is more than {} days old",
                self.staleness_threshold_days
            ),
            _ => "no date found; backend judged content stale".to_string(),
        });
        let write = ClassificationWrite {
            is_new: classification.is_new,
            category: if stale {
                OUTDATED_CATEGORY.to_string()
            } else {
                classification.category
            },
            summary: classification.summary,
            classified_hash: hash,
            exclusion: if newly_excluded { merged } else { None },
            exclusion_reason: reason,
        };

        let written = self
            .store
            .record_classification(partition, &record.url, &write)
            .await?;
        if !written {
            info!(url = %record.url, "manually excluded meanwhile; classification not stored");
        }
        Ok(Outcome::Classified {
            auto_excluded: written && newly_excluded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FileType;
    use chrono::Utc;

    fn record(url: &str, len: usize) -> Record {
        Record {
            partition: NaiveDate::from_ymd_opt(2025, 10, 10).unwrap(),
            url: url.to_string(),
            lastmodified: None,
            filetype: FileType::Html,
            extracted_text: Some("x".repeat(len)),
            source_text_hash: None,
            page_date: None,
            scrape_error: None,
            scrape_attempts: 1,
            is_new: None,
            category: None,
            summary: None,
            classified_hash: None,
            classify_failure: None,
            classify_error: None,
            classify_attempts: 0,
            excluded: None,
            exclusion_reason: None,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn limits_follow_rate() {
        assert_eq!(batch_limits(2).max_items, 1);
        assert_eq!(batch_limits(10).max_items, 3);
        assert_eq!(batch_limits(15).max_items, 5);
    }

    #[test]
    fn batches_largest_first_within_limits() {
        let limits = BatchLimits {
            max_items: 2,
            max_chars: 100,
        };
        let records = vec![
            record("https://small", 10),
            record("https://huge", 500),
            record("https://mid", 60),
            record("https://mid2", 30),
        ];
        let batches = build_batches(records, limits);
        let urls: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.iter().map(|r| r.url.as_str()).collect())
            .collect();
        assert_eq!(
            urls,
            vec![
                vec!["https://huge"],
                vec!["https://mid", "https://mid2"],
                vec!["https://small"],
            ]
        );
    }

    #[test]
    fn truncation_adds_note_only_when_cut() {
        assert_eq!(truncate_for_model("short", 10), "short");
        let cut = truncate_for_model("éééééééééé", 4);
        assert!(cut.starts_with("[NOTE TO EDITOR:"));
        assert!(cut.ends_with("éééé"));
        assert!(!cut.ends_with("ééééé"));
    }
}
