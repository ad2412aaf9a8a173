/*!
The pipeline context: owns configuration, the record store, the collaborators and the
two dispatchers, and exposes one method per command.
*/

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::briefing::{BriefingAssembler, BriefingFiles};
use crate::classify::{ClassificationBatcher, ClassifyReport};
use crate::discovery::Discovery;
use crate::dispatch::{Dispatcher, RetryPolicy};
use crate::extract::{Extractor, HttpExtractor};
use crate::llm::{self, MeetingParser, ModelBackend};
use crate::record::DiscoveredPage;
use crate::retry::{AttemptCaps, RetryController, StatusReport};
use crate::scrape::{ScrapeCoordinator, ScrapeReport};
use crate::store::{RecordStore, Selection};
use common::{init_db_pool, Config};

/// Run-wide switches from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Consult the news feeds only.
    pub news_only: bool,
    /// Process a small sample of the discovered pages.
    pub test: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub scrape: ScrapeReport,
    pub classify: ClassifyReport,
}

/// Collaborators handed to [`Pipeline::new`].
pub struct Collaborators {
    pub extractor: Arc<dyn Extractor>,
    pub backend: Arc<dyn ModelBackend>,
    pub meeting_parser: Arc<dyn MeetingParser>,
}

pub struct Pipeline {
    config: Config,
    options: RunOptions,
    store: RecordStore,
    discovery: Discovery,
    scraper: ScrapeCoordinator,
    batcher: ClassificationBatcher,
    briefing: BriefingAssembler,
    flash: Arc<Dispatcher>,
    pro: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Wire the production collaborators from configuration.
    pub async fn from_config(config: Config, options: RunOptions, cancel: CancellationToken) -> Result<Self> {
        let pool = init_db_pool(&config.database.path).await?;
        let store = RecordStore::new(pool);

        let extractor: Arc<dyn Extractor> = Arc::new(HttpExtractor::new(&config.politeness)?);
        let backend = llm::create_backend(&config.llm)?;
        info!(
            provider = backend.provider_name(),
            flash_rpm = config.llm.flash_rpm(),
            pro_rpm = config.llm.pro_rpm(),
            "model backend initialized"
        );

        let collaborators = Collaborators {
            extractor,
            backend: backend.clone(),
            meeting_parser: backend,
        };
        Self::new(config, options, store, collaborators, cancel).await
    }

    pub async fn new(
        config: Config,
        options: RunOptions,
        store: RecordStore,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Result<Self> {
        store.ensure_schema().await?;

        let policy = RetryPolicy::from_config(&config.llm);
        let flash = Arc::new(Dispatcher::new("flash", config.llm.flash_rpm(), policy.clone())?);
        let pro = Arc::new(Dispatcher::new("pro", config.llm.pro_rpm(), policy)?);

        let discovery = Discovery::new(&config.discovery, &config.politeness.user_agent())?;
        let scraper = ScrapeCoordinator::new(
            store.clone(),
            collaborators.extractor,
            &config.politeness,
            cancel.clone(),
        );
        let batcher = ClassificationBatcher::new(
            store.clone(),
            collaborators.backend.clone(),
            flash.clone(),
            &config,
            cancel.clone(),
        );
        let briefing = BriefingAssembler::new(
            store.clone(),
            collaborators.backend,
            collaborators.meeting_parser,
            flash.clone(),
            pro.clone(),
            &config,
        );

        Ok(Self {
            config,
            options,
            store,
            discovery,
            scraper,
            batcher,
            briefing,
            flash,
            pro,
            cancel,
        })
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Backend calls made so far through each tier: (flash, pro).
    pub fn dispatched(&self) -> (u64, u64) {
        (self.flash.dispatched(), self.pro.dispatched())
    }

    fn retry_controller(&self) -> RetryController<'_> {
        RetryController::new(
            &self.store,
            &self.scraper,
            &self.batcher,
            AttemptCaps {
                scrape: self.config.politeness.max_attempts(),
                classify: self.config.llm.max_attempts(),
            },
        )
    }

    /// Discover the partition's pages, sampled down in test mode.
    pub async fn discover(&self, partition: NaiveDate) -> Result<Vec<DiscoveredPage>> {
        let mut pages = self
            .discovery
            .discover(partition, self.options.news_only)
            .await
            .context("discovery failed")?;
        if self.options.test {
            let sample = self.config.pipeline.test_sample_size();
            if pages.len() > sample {
                info!("Test mode: processing {} of {} discovered pages", sample, pages.len());
                pages.truncate(sample);
            }
        }
        Ok(pages)
    }

    /// Register and scrape already discovered pages.
    pub async fn scrape_pages(&self, partition: NaiveDate, pages: Vec<DiscoveredPage>) -> Result<ScrapeReport> {
        self.scraper.run(partition, pages).await
    }

    pub async fn scrape(&self, partition: NaiveDate) -> Result<ScrapeReport> {
        let pages = self.discover(partition).await?;
        self.scrape_pages(partition, pages).await
    }

    pub async fn classify(&self, partition: NaiveDate) -> Result<ClassifyReport> {
        self.batcher.run(partition, Selection::Pending).await
    }

    /// Discover, scrape, then classify.
    pub async fn run(&self, partition: NaiveDate) -> Result<RunReport> {
        let scrape = self.scrape(partition).await?;
        if self.cancel.is_cancelled() {
            return Ok(RunReport {
                scrape,
                ..Default::default()
            });
        }
        let classify = self.classify(partition).await?;
        Ok(RunReport { scrape, classify })
    }

    pub async fn retry_scrape(&self, partition: NaiveDate) -> Result<ScrapeReport> {
        self.retry_controller().retry_scrape(partition).await
    }

    pub async fn retry_classify(&self, partition: NaiveDate) -> Result<ClassifyReport> {
        self.retry_controller().retry_classify(partition).await
    }

    pub async fn status(&self, partition: NaiveDate) -> Result<StatusReport> {
        self.retry_controller().status(partition).await
    }

    pub async fn briefing(&self, partition: NaiveDate, include_maybe: bool) -> Result<BriefingFiles> {
        self.briefing.write(partition, include_maybe).await
    }

    pub async fn briefing_text(&self, partition: NaiveDate, include_maybe: bool) -> Result<String> {
        self.briefing.assemble(partition, include_maybe).await
    }

    /// Manually exclude a url; false when the partition has no such record.
    pub async fn exclude(&self, partition: NaiveDate, url: &str, reason: Option<&str>) -> Result<bool> {
        self.store.set_exclusion(partition, url, reason).await
    }

    pub async fn include(&self, partition: NaiveDate, url: &str) -> Result<bool> {
        self.store.clear_exclusion(partition, url).await
    }
}
