//! The disclosure-harvesting engine.
//!
//! One crawl session = one site, one date window, one browsing context:
//! navigate → locate the results table → walk the pages, extracting and
//! classifying each row. Sessions are independent; their outputs only meet
//! in [`merger::merge_sources`].

pub mod classifier;
pub mod cleaner;
pub mod diagnostics;
pub mod error;
pub mod frame_locator;
pub mod merger;
pub mod pagination;
pub mod retry;
pub mod row_extractor;
pub mod sites;

use crate::browser::BrowsingContext;
use crate::config::{AppConfig, LocatorConfig};
use crate::models::{DateRange, FilingRecord, Source};
use error::{HarvestError, SkipCounts};
use frame_locator::FrameLocator;
use merger::SourceBatch;
use pagination::{CrawlSession, PaginationWalker, Termination};
use retry::RetryController;
use sites::SiteAdapter;
use std::time::Duration;
use tracing::{Instrument, info, info_span, warn};

/// Knobs shared by every session of a run.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub locator: LocatorConfig,
    pub max_pages: usize,
    pub load_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            locator: config.locator.clone(),
            max_pages: config.pagination.max_pages,
            load_timeout: config.browser.page_load_timeout(),
        }
    }
}

/// What one session produced. Records read before a failure are kept.
#[derive(Debug)]
pub struct SessionReport {
    pub source: Source,
    pub label: String,
    pub classifies_by_period: bool,
    pub records: Vec<FilingRecord>,
    pub skips: SkipCounts,
    pub pages: usize,
    pub outcome: Result<Termination, HarvestError>,
}

impl SessionReport {
    pub fn into_batch(self) -> SourceBatch {
        SourceBatch {
            source: self.source,
            classifies_by_period: self.classifies_by_period,
            records: self.records,
        }
    }
}

/// Run one crawl session to completion. The context is closed on every path.
pub async fn run_session<C>(
    ctx: &C,
    site: &dyn SiteAdapter,
    range: DateRange,
    settings: &SessionSettings,
    retry: &RetryController,
) -> SessionReport
where
    C: BrowsingContext + ?Sized,
{
    let span = info_span!("session", site = %site.label(), window = %range);
    async move {
        let mut session = CrawlSession::new(site.source(), range);
        let outcome = crawl(ctx, site, &mut session, settings, retry).await;

        if let Err(e) = ctx.close().await {
            warn!("Closing browsing context failed: {}", e);
        }

        match &outcome {
            Ok(_) if !session.found_in_range => info!(
                "Finished: nothing filed inside {} ({} skipped, {} page(s))",
                range,
                session.skips.total(),
                session.pages_read()
            ),
            Ok(term) => info!(
                "Finished ({}): {} record(s), {} skipped, {} page(s)",
                term.as_str(),
                session.records.len(),
                session.skips.total(),
                session.pages_read()
            ),
            Err(e) => warn!(
                "Failed after {} record(s) on {} page(s): {}",
                session.records.len(),
                session.pages_read(),
                e
            ),
        }

        SessionReport {
            source: site.source(),
            label: site.label(),
            classifies_by_period: site.classifies_by_period(),
            pages: session.pages_read(),
            records: session.records,
            skips: session.skips,
            outcome,
        }
    }
    .instrument(span)
    .await
}

async fn crawl<C>(
    ctx: &C,
    site: &dyn SiteAdapter,
    session: &mut CrawlSession,
    settings: &SessionSettings,
    retry: &RetryController,
) -> Result<Termination, HarvestError>
where
    C: BrowsingContext + ?Sized,
{
    let entry = site.entry_url(&session.range)?;
    let locator = FrameLocator::new(
        site.required_headers().to_vec(),
        &settings.locator,
        settings.load_timeout,
    );

    let found = locator.locate(ctx, &entry, retry).await?;
    session.frame_path = found.frame_path;

    let walker = PaginationWalker {
        locator: &locator,
        site,
        retry,
        max_pages: settings.max_pages,
        load_timeout: settings.load_timeout,
    };
    walker.walk(ctx, session, found.table).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{FixtureContext, FixtureFrame, FixtureTable, listing_row};
    use crate::config::{BackoffKind, SiteConfig};
    use diagnostics::DiagnosticsRecorder;
    use retry::RetryPolicy;
    use sites::ConfiguredSite;
    use chrono::NaiveDate;
    use tokio_util::sync::CancellationToken;

    fn settings() -> SessionSettings {
        SessionSettings {
            locator: LocatorConfig { max_depth: 6, attempts: 2, reload_interval_ms: 0 },
            max_pages: 10,
            load_timeout: Duration::from_secs(1),
        }
    }

    fn retry() -> RetryController {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: BackoffKind::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        RetryController::new(policy, DiagnosticsRecorder::disabled(), CancellationToken::new())
    }

    fn window() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 7).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn irrelevant_row_is_counted_not_emitted() {
        let rows = vec![
            listing_row("2024/02/01", "15:00", "1234", "テスト", "2024年3月期 第3四半期決算短信", "/a.pdf"),
            listing_row("2024/02/01", "15:30", "1234", "テスト", "年次レポート", "/b.pdf"),
        ];
        let ctx = FixtureContext::single(
            FixtureFrame::default().with_child(FixtureFrame::default().with_table(FixtureTable::listing(rows))),
        );
        let site = ConfiguredSite::new(SiteConfig::preset(Source::RegistryA)).unwrap();

        let report = run_session(&ctx, &site, window(), &settings(), &retry()).await;

        assert!(report.outcome.is_ok());
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.skips.no_relevance_keyword, 1);
        assert_eq!(report.skips.total(), 1);
        assert!(ctx.is_closed());
    }

    #[tokio::test]
    async fn http_session_reads_every_page_of_a_framed_listing() {
        use crate::browser::http_context::HttpBrowsingContext;
        use crate::browser::http_context::local_site::{LocalSite, paged_listing};
        use crate::config::BrowserConfig;

        let server = LocalSite::serve(&paged_listing()).await;
        let mut config = SiteConfig::preset(Source::RegistryA);
        config.entry_url = server.url("index.html").to_string();
        config.base_url = server.base.to_string();
        let site = ConfiguredSite::new(config).unwrap();
        let ctx = HttpBrowsingContext::new(&BrowserConfig {
            request_delay_ms: 0,
            jitter_ms: 0,
            ..BrowserConfig::default()
        })
        .unwrap();

        let report = run_session(&ctx, &site, window(), &settings(), &retry()).await;

        assert!(matches!(report.outcome, Ok(Termination::NoMorePages)));
        assert_eq!(report.pages, 2);
        let codes: Vec<_> = report.records.iter().map(|r| r.company_code.as_str()).collect();
        assert_eq!(codes, ["12340", "56780", "99990"]);
        assert_eq!(report.records[2].document_url, server.url("pdf/c.pdf"));
        assert_eq!((report.records[2].fiscal_year, report.records[2].fiscal_quarter), (2023, 4));
    }

    #[tokio::test]
    async fn missing_table_fails_the_session_but_closes_the_context() {
        let ctx = FixtureContext::single(FixtureFrame::default());
        let site = ConfiguredSite::new(SiteConfig::preset(Source::RegistryA)).unwrap();

        let report = run_session(&ctx, &site, window(), &settings(), &retry()).await;

        assert!(matches!(report.outcome, Err(HarvestError::StructuralParse { .. })));
        assert!(report.records.is_empty());
        assert!(ctx.is_closed());
    }
}
