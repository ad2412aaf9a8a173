/*
logfiler - command line entry point.
Each subcommand runs one pipeline operation against a single date partition.
*/

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use common::Config;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use logfiler::pipeline::{Pipeline, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "logfiler", about = "Daily change tracker and briefing generator")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Partition date (YYYY-MM-DD), defaults to yesterday
    #[arg(long, value_name = "DATE")]
    date: Option<NaiveDate>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Discover from the news feeds only
    #[arg(long)]
    news_only: bool,

    /// Process a small sample of the discovered pages
    #[arg(long)]
    test: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover, scrape and classify
    Run,
    /// Discover and scrape only
    Scrape,
    /// Classify scraped records without a current classification
    Classify,
    /// Re-scrape failed records
    RetryScrape,
    /// Re-classify failed records, parse failures included
    RetryClassify,
    /// Write the markdown briefing and its HTML rendering
    Briefing {
        /// Also include records classified as "maybe"
        #[arg(long)]
        include_maybe: bool,
    },
    /// Per-state counts and failed urls
    Status,
    /// Manually exclude a url from the briefing
    Exclude {
        url: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clear an exclusion
    Include { url: String },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");
    let override_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
            }
            Some(p)
        }
        None => {
            let p = PathBuf::from("config.toml");
            p.exists().then_some(p)
        }
    };

    let config = Config::load_with_defaults(
        default_path.exists().then_some(default_path.as_path()),
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(args.config).await?;
    let partition = args
        .date
        .unwrap_or_else(|| Local::now().date_naive() - ChronoDuration::days(1));
    info!(%partition, "using partition");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight records");
            on_signal.cancel();
        }
    });

    let options = RunOptions {
        news_only: args.news_only,
        test: args.test,
    };
    let pipeline = Pipeline::from_config(config, options, cancel).await?;

    match args.command {
        Command::Run => {
            let report = pipeline.run(partition).await?;
            println!("{}", serde_json::to_string_pretty(&report.scrape)?);
            println!("{}", serde_json::to_string_pretty(&report.classify)?);
        }
        Command::Scrape => {
            let report = pipeline.scrape(partition).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Classify => {
            let report = pipeline.classify(partition).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RetryScrape => {
            let report = pipeline.retry_scrape(partition).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RetryClassify => {
            let report = pipeline.retry_classify(partition).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Briefing { include_maybe } => {
            let files = pipeline.briefing(partition, include_maybe).await?;
            println!("{}", files.markdown.display());
            println!("{}", files.html.display());
        }
        Command::Status => {
            let status = pipeline.status(partition).await?;
            print!("{}", status);
        }
        Command::Exclude { url, reason } => {
            if !pipeline.exclude(partition, &url, reason.as_deref()).await? {
                anyhow::bail!("no record for {} in partition {}", url, partition);
            }
            println!("excluded {}", url);
        }
        Command::Include { url } => {
            if !pipeline.include(partition, &url).await? {
                anyhow::bail!("no record for {} in partition {}", url, partition);
            }
            println!("included {}", url);
        }
    }

    Ok(())
}
