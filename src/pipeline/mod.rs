//! Pipeline orchestrator: crawl sessions → merge → sink.
//!
//! ## Run modes
//!
//! `harvest()`: one session per source over a date window:
//!   1. Spawn a session per source, at most `pipeline.concurrency` at a time.
//!      Each session owns its own browsing context.
//!   2. Barrier: wait for every session, successful or not.
//!   3. Merge all batches in `pipeline.merge_order` (later source wins).
//!   4. Commit the merged set to the sink as one idempotent batch.
//!
//! `harvest_companies()`: one company-site session per target, in batches of
//!   `pipeline.batch_size` with `pipeline.batch_delay_secs` between batches.
//!
//! Neither mode fails because a session failed; the summary says which did.

use crate::browser::BrowsingContext;
use crate::browser::http_context::HttpBrowsingContext;
use crate::config::{AppConfig, BrowserConfig, SiteConfig};
use crate::harvester::diagnostics::DiagnosticsRecorder;
use crate::harvester::error::SkipCounts;
use crate::harvester::merger::{KeyMode, MergeConflict, SourceBatch, merge_sources};
use crate::harvester::retry::{RetryController, RetryPolicy};
use crate::harvester::sites::{ConfiguredSite, SiteAdapter};
use crate::harvester::{SessionReport, SessionSettings, run_session};
use crate::models::{CompanyTarget, DateRange, FilingRecord, Source};
use crate::storage::{FilingSink, RunTotals};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// Browsing contexts

/// Opens a fresh, independent browsing context for each session.
pub trait ContextFactory: Send + Sync {
    fn open(&self, label: &str) -> Result<Box<dyn BrowsingContext>>;
}

pub struct HttpContextFactory {
    config: BrowserConfig,
}

impl HttpContextFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

impl ContextFactory for HttpContextFactory {
    fn open(&self, label: &str) -> Result<Box<dyn BrowsingContext>> {
        let ctx = HttpBrowsingContext::new(&self.config)
            .with_context(|| format!("Failed to build HTTP context for {label}"))?;
        Ok(Box::new(ctx))
    }
}

// Summary

/// Outcome of one unit of work (a source, or a company).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub label: String,
    pub source: Source,
    pub records: usize,
    pub pages: usize,
    pub skips: SkipCounts,
    pub stopped: Option<&'static str>,
    pub error: Option<String>,
}

impl SessionSummary {
    fn from_report(report: &SessionReport) -> Self {
        Self {
            label: report.label.clone(),
            source: report.source,
            records: report.records.len(),
            pages: report.pages,
            skips: report.skips,
            stopped: report.outcome.as_ref().ok().map(|t| t.as_str()),
            error: report.outcome.as_ref().err().map(|e| format!("{e:#}")),
        }
    }

    fn failed(label: String, source: Source, error: String) -> Self {
        Self {
            label,
            source,
            records: 0,
            pages: 0,
            skips: SkipCounts::default(),
            stopped: None,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Partial-success report of a whole harvest.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub window: DateRange,
    pub sessions: Vec<SessionSummary>,
    pub records_harvested: usize,
    pub records_merged: usize,
    pub records_committed: usize,
    pub skips: SkipCounts,
    pub merge_mode: KeyMode,
    pub conflicts: Vec<MergeConflict>,
    #[serde(skip)]
    pub records: Vec<FilingRecord>,
}

impl HarvestSummary {
    pub fn sessions_failed(&self) -> usize {
        self.sessions.iter().filter(|s| !s.succeeded()).count()
    }

    pub fn totals(&self) -> RunTotals {
        RunTotals {
            sessions_total: self.sessions.len(),
            sessions_failed: self.sessions_failed(),
            records_committed: self.records_committed,
            rows_skipped: self.skips.total(),
        }
    }
}

// Pipeline

pub struct Pipeline {
    config: AppConfig,
    contexts: Arc<dyn ContextFactory>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: AppConfig, contexts: Arc<dyn ContextFactory>) -> Self {
        Self {
            config,
            contexts,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token aborts every running session at its next
    /// browser action or delay.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The session deadline is applied once the session holds a permit.
    fn controller(&self) -> RetryController {
        RetryController::new(
            RetryPolicy::from_config(&self.config.retry),
            DiagnosticsRecorder::new(&self.config.diagnostics),
            self.cancel.child_token(),
        )
    }

    fn site_config(&self, source: Source) -> SiteConfig {
        self.config
            .site(source)
            .cloned()
            .unwrap_or_else(|| SiteConfig::preset(source))
    }

    /// Sources to crawl: the requested ones, or every enabled one.
    pub fn resolve_sources(&self, requested: &[Source]) -> Vec<Source> {
        if requested.is_empty() {
            self.config
                .sources
                .iter()
                .filter(|s| s.enabled)
                .map(|s| s.source)
                .collect()
        } else {
            let mut sources = requested.to_vec();
            sources.sort();
            sources.dedup();
            sources
        }
    }

    pub async fn harvest(&self, range: DateRange, requested: &[Source], sink: &dyn FilingSink) -> Result<HarvestSummary> {
        let sources = self.resolve_sources(requested);
        info!("=== Harvest {} from {} source(s) ===", range, sources.len());

        let mut failed = Vec::new();
        let mut sites = Vec::new();
        for source in sources {
            match ConfiguredSite::new(self.site_config(source)) {
                Ok(site) => sites.push(site),
                Err(e) => {
                    warn!("{}: {}", source, e);
                    failed.push(SessionSummary::failed(source.to_string(), source, e.to_string()));
                }
            }
        }

        let run_id = begin_run(sink, "harvest");
        let (mut sessions, batches) = self.run_sessions(sites, range).await;
        sessions.extend(failed);
        self.finish(range, sessions, batches, sink, run_id)
    }

    pub async fn harvest_companies(
        &self,
        range: DateRange,
        companies: &[CompanyTarget],
        sink: &dyn FilingSink,
    ) -> Result<HarvestSummary> {
        let template = self.site_config(Source::CompanySite);
        let batch_size = self.config.pipeline.batch_size.max(1);
        let batch_delay = Duration::from_secs(self.config.pipeline.batch_delay_secs);
        let total_batches = companies.len().div_ceil(batch_size);
        info!(
            "=== Harvest {} for {} companies in {} batch(es) ===",
            range,
            companies.len(),
            total_batches
        );

        let run_id = begin_run(sink, "companies");
        let mut sessions = Vec::new();
        let mut batches = Vec::new();

        for (n, chunk) in companies.chunks(batch_size).enumerate() {
            if n > 0 && !batch_delay.is_zero() {
                info!("Batch {}/{} done, pausing {:?}", n, total_batches, batch_delay);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => warn!("Cancelled between batches"),
                    _ = tokio::time::sleep(batch_delay) => {}
                }
            }

            let mut sites = Vec::new();
            for target in chunk {
                match ConfiguredSite::for_company(template.clone(), target) {
                    Ok(site) => sites.push(site),
                    Err(e) => {
                        warn!("{}: {}", target.code, e);
                        sessions.push(SessionSummary::failed(
                            format!("{}:{}", Source::CompanySite, target.code),
                            Source::CompanySite,
                            e.to_string(),
                        ));
                    }
                }
            }

            let (done, found) = self.run_sessions(sites, range).await;
            sessions.extend(done);
            batches.extend(found);
        }

        self.finish(range, sessions, batches, sink, run_id)
    }

    /// Run one session per site concurrently and wait for all of them.
    async fn run_sessions(&self, sites: Vec<ConfiguredSite>, range: DateRange) -> (Vec<SessionSummary>, Vec<SourceBatch>) {
        let sem = Arc::new(Semaphore::new(self.config.pipeline.concurrency.max(1)));
        let settings = SessionSettings::from_config(&self.config);
        let budget = Duration::from_secs(self.config.retry.session_deadline_secs);
        let mut handles = Vec::new();

        for site in sites {
            let label = site.label();
            let source = site.source();
            let contexts = Arc::clone(&self.contexts);
            let sem = Arc::clone(&sem);
            let settings = settings.clone();
            let retry = self.controller();
            let task_label = label.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await?;
                let retry = retry.with_deadline(budget);
                let ctx = contexts.open(&task_label)?;
                Ok::<SessionReport, anyhow::Error>(run_session(&*ctx, &site, range, &settings, &retry).await)
            });

            handles.push((label, source, handle));
        }

        let mut sessions = Vec::new();
        let mut batches = Vec::new();
        for (label, source, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => {
                    sessions.push(SessionSummary::from_report(&report));
                    if !report.records.is_empty() {
                        batches.push(report.into_batch());
                    }
                }
                Ok(Err(e)) => {
                    warn!("{}: {:#}", label, e);
                    sessions.push(SessionSummary::failed(label, source, format!("{e:#}")));
                }
                Err(e) => {
                    error!("Task panic for {}: {}", label, e);
                    sessions.push(SessionSummary::failed(label, source, format!("task panicked: {e}")));
                }
            }
        }
        (sessions, batches)
    }

    fn finish(
        &self,
        window: DateRange,
        sessions: Vec<SessionSummary>,
        batches: Vec<SourceBatch>,
        sink: &dyn FilingSink,
        run_id: Option<i64>,
    ) -> Result<HarvestSummary> {
        let records_harvested = batches.iter().map(|b| b.records.len()).sum();
        let mut skips = SkipCounts::default();
        for s in &sessions {
            skips.absorb(&s.skips);
        }

        let merged = merge_sources(batches, &self.config.pipeline.merge_order);

        let mut summary = HarvestSummary {
            window,
            sessions,
            records_harvested,
            records_merged: merged.records.len(),
            records_committed: 0,
            skips,
            merge_mode: merged.mode,
            conflicts: merged.conflicts,
            records: merged.records,
        };

        let committed = sink.upsert_filings(&summary.records);
        let commit_error = committed.as_ref().err().map(|e| format!("{e:#}"));
        if let Some(id) = run_id {
            if let Err(e) = sink.finish_run(id, &summary.totals(), commit_error.as_deref()) {
                warn!("Could not finish harvest run {}: {:#}", id, e);
            }
        }
        summary.records_committed = committed.context("Committing merged filings failed")?;

        info!(
            "=== Done: {} session(s), {} failed | {} harvested → {} merged ({} conflicts) | {} committed | {} skipped ===",
            summary.sessions.len(),
            summary.sessions_failed(),
            summary.records_harvested,
            summary.records_merged,
            summary.conflicts.len(),
            summary.records_committed,
            summary.skips.total(),
        );
        Ok(summary)
    }
}

fn begin_run(sink: &dyn FilingSink, label: &str) -> Option<i64> {
    match sink.begin_run(label) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Could not record harvest run: {:#}", e);
            None
        }
    }
}
