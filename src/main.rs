mod browser;
mod config;
mod harvester;
mod loader;
mod models;
mod pipeline;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{AppConfig, SiteConfig};
use crate::harvester::classifier::classify_filing;
use crate::harvester::cleaner::{normalize_title, parse_scaled_amount};
use crate::harvester::merger::{SourceBatch, merge_sources};
use crate::models::{DateRange, ReportType, Source};
use crate::pipeline::{HarvestSummary, HttpContextFactory, Pipeline};
use crate::storage::{FilingSink, Repository};

#[derive(Parser)]
#[command(name = "disclosure-harvester", about = "Corporate disclosure listing harvester", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl disclosure sites over a date window and commit the merged filings
    Harvest {
        /// First filing date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last filing date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,

        /// Sources to crawl (default: every enabled source)
        #[arg(long = "source", value_enum)]
        sources: Vec<Source>,

        /// Also write the merged filings to this CSV
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Crawl the IR pages of every company listed in a CSV (code,name,ir_url)
    Companies {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        /// Only crawl companies whose revenue column is at least this ("1000億", "5e10")
        #[arg(long, value_parser = parse_amount)]
        min_revenue: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Merge previously exported filing CSVs in the configured source order
    Merge {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Upsert the merged filings into the database
        #[arg(long)]
        commit: bool,
    },

    /// Export every stored filing to CSV
    Export {
        #[arg(short, long, default_value = "data/filings.csv")]
        out: PathBuf,
    },

    /// Show the fiscal period and report type a title classifies to
    Classify {
        title: String,

        /// Filing date for term-numbered titles (default: today)
        #[arg(long)]
        filed: Option<NaiveDate>,
    },

    /// Show database statistics
    Stats,

    /// Apply schema migrations without harvesting
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "disclosure_harvester=info,warn",
        1 => "disclosure_harvester=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Harvest { from, to, sources, out, json } => {
            let _t = utils::Timer::start("Harvest");
            let range = DateRange::new(from, to)?;
            let repo = open_repo(&config)?;
            let pipeline = http_pipeline(config);

            let summary = pipeline.harvest(range, &sources, &repo).await?;
            if let Some(path) = out {
                loader::write_records(&path, &summary.records)?;
            }
            report(&summary, json)?;
        }

        Command::Companies { file, from, to, min_revenue, json } => {
            let _t = utils::Timer::start("Company harvest");
            let range = DateRange::new(from, to)?;
            let companies = loader::read_companies(&file, min_revenue)?;
            let repo = open_repo(&config)?;
            let pipeline = http_pipeline(config);

            let summary = pipeline.harvest_companies(range, &companies, &repo).await?;
            report(&summary, json)?;
        }

        Command::Merge { inputs, out, commit } => {
            let mut by_source: BTreeMap<Source, Vec<_>> = BTreeMap::new();
            for path in &inputs {
                for record in loader::read_records(path)? {
                    by_source.entry(record.source).or_default().push(record);
                }
            }

            let batches = by_source
                .into_iter()
                .map(|(source, records)| SourceBatch {
                    source,
                    classifies_by_period: site_config(&config, source).classifies_by_period,
                    records,
                })
                .collect();
            let merged = merge_sources(batches, &config.pipeline.merge_order);
            info!(
                "Merged {} files into {} filings ({:?} keys, {} conflicts)",
                inputs.len(),
                merged.records.len(),
                merged.mode,
                merged.conflicts.len()
            );

            if let Some(path) = out {
                loader::write_records(&path, &merged.records)?;
            }
            if commit {
                let n = open_repo(&config)?.upsert_filings(&merged.records)?;
                println!("Committed {} filings.", utils::fmt_number(n as i64));
            }
        }

        Command::Export { out } => {
            let repo = open_repo(&config)?;
            let records = repo.list_filings(None)?;
            loader::write_records(&out, &records)?;
            println!("Exported {} filings to {:?}", utils::fmt_number(records.len() as i64), out);
        }

        Command::Classify { title, filed } => {
            let filed = filed.unwrap_or_else(|| chrono::Local::now().date_naive());
            let normalized = normalize_title(&title);
            println!("Title       : {}", normalized);
            println!("Report type : {}", ReportType::from_title(&normalized).as_str());
            match classify_filing(&title, filed) {
                Some(p) => println!("Period      : FY{} Q{}", p.year, p.quarter),
                None => println!("Period      : unclassified (would be skipped)"),
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let filings = repo.filing_count()?;
            let companies = repo.company_count()?;
            let (min, max) = repo.date_range().unwrap_or((None, None));
            println!("─────────────────────────────────");
            println!("  Disclosure Harvester — Stats");
            println!("─────────────────────────────────");
            println!("  Companies : {}", utils::fmt_number(companies));
            println!("  Filings   : {}", utils::fmt_number(filings));
            for (source, n) in repo.counts_by_source()? {
                println!("    {:<13}: {}", source, utils::fmt_number(n));
            }
            println!("  From      : {}", utils::or_dash(min));
            println!("  To        : {}", utils::or_dash(max));
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn parse_amount(s: &str) -> Result<f64, String> {
    parse_scaled_amount(s).ok_or_else(|| format!("not an amount: {s:?}"))
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

fn site_config(config: &AppConfig, source: Source) -> SiteConfig {
    config
        .site(source)
        .cloned()
        .unwrap_or_else(|| SiteConfig::preset(source))
}

/// Pipeline over HTTP contexts, cancelled on Ctrl-C.
fn http_pipeline(config: AppConfig) -> Pipeline {
    let contexts = Arc::new(HttpContextFactory::new(config.browser.clone()));
    let pipeline = Pipeline::new(config, contexts);

    let cancel = pipeline.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling sessions");
            cancel.cancel();
        }
    });
    pipeline
}

fn report(summary: &HarvestSummary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("Failed to serialize summary")?
        );
        return Ok(());
    }

    println!("─────────────────────────────────");
    println!("  Harvest {}", summary.window);
    println!("─────────────────────────────────");
    for s in &summary.sessions {
        match &s.error {
            None => println!(
                "  ✓ {:<22} {:>5} filings  {:>3} pages  {} skipped  ({})",
                s.label,
                s.records,
                s.pages,
                s.skips.total(),
                s.stopped.unwrap_or("-")
            ),
            Some(e) => println!("  ✗ {:<22} {:>5} filings  {}", s.label, s.records, e),
        }
    }
    println!("─────────────────────────────────");
    println!("  Harvested : {}", utils::fmt_number(summary.records_harvested as i64));
    println!("  Merged    : {}", utils::fmt_number(summary.records_merged as i64));
    println!("  Committed : {}", utils::fmt_number(summary.records_committed as i64));
    println!("  Skipped   : {}", utils::fmt_number(summary.skips.total() as i64));
    println!("  Conflicts : {}", summary.conflicts.len());
    println!(
        "  Failed    : {} of {} sessions",
        summary.sessions_failed(),
        summary.sessions.len()
    );
    println!("─────────────────────────────────");
    Ok(())
}
