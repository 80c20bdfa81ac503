use super::classifier::classify_row;
use super::error::{HarvestError, SkipCounts, SkipReason};
use super::frame_locator::FrameLocator;
use super::retry::RetryController;
use super::row_extractor::{extract_row, row_date};
use super::sites::SiteAdapter;
use crate::browser::{BrowserError, BrowsingContext, TableHandle};
use crate::models::{DateRange, FilingRecord, Source};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A date-ordered page lay entirely before the window start.
    RangeExhausted,
    NoMorePages,
    /// Safeguard against a "next" control that never goes away.
    PageLimit,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::RangeExhausted => "range exhausted",
            Termination::NoMorePages => "no more pages",
            Termination::PageLimit => "page limit reached",
        }
    }
}

/// State of one (source, window) crawl. Lives only as long as the crawl.
#[derive(Debug, Clone)]
pub struct CrawlSession {
    pub source: Source,
    pub range: DateRange,
    pub frame_path: Vec<usize>,
    /// Zero-based index of the page being read.
    pub page_index: usize,
    pub records: Vec<FilingRecord>,
    pub found_in_range: bool,
    pub skips: SkipCounts,
}

impl CrawlSession {
    pub fn new(source: Source, range: DateRange) -> Self {
        Self {
            source,
            range,
            frame_path: Vec::new(),
            page_index: 0,
            records: Vec::new(),
            found_in_range: false,
            skips: SkipCounts::default(),
        }
    }

    pub fn pages_read(&self) -> usize {
        self.page_index + 1
    }

    fn skip(&mut self, row: usize, reason: SkipReason) {
        debug!("page {} row {}: skipped ({})", self.page_index, row, reason);
        self.skips.record(reason);
    }
}

#[derive(Debug, Default)]
struct PageScan {
    rows: usize,
    in_range: usize,
    dated: usize,
    before_start: usize,
}

impl PageScan {
    fn precedes_window(&self) -> bool {
        self.dated > 0 && self.before_start == self.dated
    }
}

pub struct PaginationWalker<'a> {
    pub locator: &'a FrameLocator,
    pub site: &'a dyn SiteAdapter,
    pub retry: &'a RetryController,
    pub max_pages: usize,
    pub load_timeout: Duration,
}

impl PaginationWalker<'_> {
    /// Read pages starting from `table` until the window, the listing, or the
    /// page budget runs out.
    pub async fn walk<C>(
        &self,
        ctx: &C,
        session: &mut CrawlSession,
        mut table: TableHandle,
    ) -> Result<Termination, HarvestError>
    where
        C: BrowsingContext + ?Sized,
    {
        loop {
            let scan = self.read_page(ctx, session, &table).await?;
            info!(
                "Page {}: {} row(s), {} in range, {} record(s) so far",
                session.pages_read(),
                scan.rows,
                scan.in_range,
                session.records.len()
            );

            if self.site.date_ordered() && scan.precedes_window() {
                return Ok(Termination::RangeExhausted);
            }
            if session.pages_read() >= self.max_pages {
                warn!("Stopping after {} page(s): page limit", session.pages_read());
                return Ok(Termination::PageLimit);
            }
            if !self.next_page(ctx).await? {
                return Ok(Termination::NoMorePages);
            }

            session.page_index += 1;
            table = self.table_after_page_change(ctx, session).await?;
        }
    }

    async fn read_page<C>(
        &self,
        ctx: &C,
        session: &mut CrawlSession,
        table: &TableHandle,
    ) -> Result<PageScan, HarvestError>
    where
        C: BrowsingContext + ?Sized,
    {
        let rows = self.retry.run(ctx, "list rows", || ctx.rows(table)).await?;
        let rules = self.site.row_rules();
        let mut scan = PageScan { rows: rows.len(), ..PageScan::default() };

        for row in &rows {
            let cells = match ctx.row_cells(row).await {
                Ok(cells) => cells,
                Err(e) if e.is_transient() => {
                    debug!("row {}: {}", row.index, e);
                    session.skip(row.index, SkipReason::StaleRow);
                    continue;
                }
                Err(e) => {
                    let what = format!("reading row {} on page {}: {e}", row.index, session.pages_read());
                    return Err(self.retry.fail_structural(ctx, &what).await);
                }
            };

            if let Some(date) = row_date(&cells, rules.layout) {
                scan.dated += 1;
                if session.range.precedes(date) {
                    scan.before_start += 1;
                }
            }

            let record = match extract_row(&cells, &rules).and_then(|raw| classify_row(raw, session.source)) {
                Ok(record) => record,
                Err(reason) => {
                    session.skip(row.index, reason);
                    continue;
                }
            };

            if !session.range.contains(record.filing_date()) {
                session.skip(row.index, SkipReason::OutOfRange);
                continue;
            }

            scan.in_range += 1;
            session.found_in_range = true;
            session.records.push(record);
        }

        Ok(scan)
    }

    /// Activate the "next" control if there is one.
    async fn next_page<C>(&self, ctx: &C) -> Result<bool, HarvestError>
    where
        C: BrowsingContext + ?Sized,
    {
        let labels = self.site.next_page_labels();
        let moved = self
            .retry
            .run(ctx, "next page", || async move {
                match ctx.find_control(labels).await? {
                    Some(control) => {
                        ctx.activate(&control).await?;
                        Ok::<_, BrowserError>(true)
                    }
                    None => Ok(false),
                }
            })
            .await?;

        if moved {
            self.retry
                .run(ctx, "wait for load", || ctx.wait_until_loaded(self.load_timeout))
                .await?;
        }
        Ok(moved)
    }

    /// Element references die with the old page: go back down the known frame
    /// path, falling back to a fresh search of the new document.
    async fn table_after_page_change<C>(
        &self,
        ctx: &C,
        session: &mut CrawlSession,
    ) -> Result<TableHandle, HarvestError>
    where
        C: BrowsingContext + ?Sized,
    {
        let path = session.frame_path.clone();
        let reacquired = self
            .retry
            .run(ctx, "reacquire table", || self.locator.reacquire(ctx, &path))
            .await?;
        if let Some(table) = reacquired {
            return Ok(table);
        }

        debug!("Frame path {:?} no longer holds the table, searching again", path);
        match self.locator.find(ctx, self.retry).await? {
            Some(found) => {
                session.frame_path = found.frame_path;
                Ok(found.table)
            }
            None => {
                let what = format!("results table vanished after moving to page {}", session.pages_read());
                Err(self.retry.fail_structural(ctx, &what).await)
            }
        }
    }
}
