use crate::models::{FilingRecord, ReportType, Source};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use duckdb::{Connection, params};
use serde::Serialize;
use std::path::Path;
use tracing::info;
use url::Url;

// Schema

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS filings (
    company_code     VARCHAR   NOT NULL,
    fiscal_year      INTEGER   NOT NULL,
    fiscal_quarter   INTEGER   NOT NULL CHECK (fiscal_quarter BETWEEN 1 AND 4),
    source           VARCHAR   NOT NULL,
    company_name     VARCHAR   NOT NULL DEFAULT '',
    title            VARCHAR   NOT NULL,
    document_url     VARCHAR   NOT NULL,
    filing_datetime  TIMESTAMP NOT NULL,
    report_type      VARCHAR   NOT NULL,
    harvested_at     TIMESTAMP NOT NULL,
    PRIMARY KEY (company_code, fiscal_year, fiscal_quarter, source)
);

CREATE SEQUENCE IF NOT EXISTS harvest_runs_id_seq;

CREATE TABLE IF NOT EXISTS harvest_runs (
    id                  INTEGER PRIMARY KEY DEFAULT nextval('harvest_runs_id_seq'),
    label               VARCHAR NOT NULL,
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    sessions_total      INTEGER DEFAULT 0,
    sessions_failed     INTEGER DEFAULT 0,
    records_committed   INTEGER DEFAULT 0,
    rows_skipped        INTEGER DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

// Upserts rewrite every non-key column, so only key columns are indexed.
const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_filings_code   ON filings (company_code);
CREATE INDEX IF NOT EXISTS idx_filings_period ON filings (fiscal_year, fiscal_quarter);
"#;

// Sink boundary

/// Counts written to the run log when a harvest finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunTotals {
    pub sessions_total: usize,
    pub sessions_failed: usize,
    pub records_committed: usize,
    pub rows_skipped: usize,
}

impl RunTotals {
    pub fn status(&self) -> &'static str {
        match (self.sessions_failed, self.sessions_total) {
            (0, _) => "success",
            (failed, total) if failed < total => "partial",
            _ => "failed",
        }
    }
}

/// Where merged records end up. Upserts must be idempotent on the natural
/// key so a repeated harvest never duplicates rows.
pub trait FilingSink {
    /// Write the whole batch in one transaction; returns rows written.
    fn upsert_filings(&self, records: &[FilingRecord]) -> Result<usize>;

    fn begin_run(&self, label: &str) -> Result<i64>;

    fn finish_run(&self, run_id: i64, totals: &RunTotals, error: Option<&str>) -> Result<()>;
}

// Repository

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // Filings

    pub fn filing_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM filings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn company_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(DISTINCT company_code) FROM filings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn counts_by_source(&self) -> Result<Vec<(String, i64)>> {
        let mut s = self
            .conn
            .prepare("SELECT source, COUNT(*) FROM filings GROUP BY source ORDER BY source")?;
        let rows = s
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let mut s = self.conn.prepare(
            "SELECT CAST(MIN(filing_datetime) AS DATE), CAST(MAX(filing_datetime) AS DATE) FROM filings",
        )?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    /// Stored filings, oldest first.
    pub fn list_filings(&self, limit: Option<usize>) -> Result<Vec<FilingRecord>> {
        let limit = limit.map_or(i64::MAX, |n| n as i64);
        let mut stmt = self.conn.prepare(
            r#"SELECT company_code, company_name, title, document_url, source,
                      filing_datetime, fiscal_year, fiscal_quarter, report_type
               FROM filings
               ORDER BY filing_datetime, company_code, source
               LIMIT ?"#,
        )?;

        type Row = (String, String, String, String, String, NaiveDateTime, i32, i32, String);
        let rows: Vec<Row> = stmt
            .query_map(params![limit], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        rows.into_iter()
            .map(|(code, name, title, url, source, filed_at, year, quarter, report_type)| -> Result<FilingRecord> {
                Ok(FilingRecord {
                    document_url: Url::parse(&url)
                        .with_context(|| format!("stored url for {code} is invalid"))?,
                    source: source.parse::<Source>()?,
                    report_type: report_type.parse::<ReportType>()?,
                    fiscal_quarter: u8::try_from(quarter)
                        .with_context(|| format!("stored quarter {quarter} for {code}"))?,
                    company_code: code,
                    company_name: name,
                    title,
                    filing_datetime: filed_at,
                    fiscal_year: year,
                })
            })
            .collect()
    }
}

impl FilingSink for Repository {
    fn upsert_filings(&self, records: &[FilingRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().naive_utc();
        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO filings
                (company_code, fiscal_year, fiscal_quarter, source, company_name, title,
                 document_url, filing_datetime, report_type, harvested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (company_code, fiscal_year, fiscal_quarter, source) DO UPDATE SET
                company_name    = excluded.company_name,
                title           = excluded.title,
                document_url    = excluded.document_url,
                filing_datetime = excluded.filing_datetime,
                report_type     = excluded.report_type,
                harvested_at    = excluded.harvested_at
        "#;

        for f in records {
            tx.execute(
                sql,
                params![
                    f.company_code,
                    f.fiscal_year,
                    f.fiscal_quarter as i32,
                    f.source.as_str(),
                    f.company_name,
                    f.title,
                    f.document_url.as_str(),
                    f.filing_datetime,
                    f.report_type.as_str(),
                    now,
                ],
            )
            .with_context(|| {
                format!(
                    "upsert filing {} FY{} Q{} ({})",
                    f.company_code, f.fiscal_year, f.fiscal_quarter, f.source
                )
            })?;
        }

        tx.commit()?;
        Ok(records.len())
    }

    // Harvest run log

    fn begin_run(&self, label: &str) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO harvest_runs (label, started_at, status) VALUES (?, ?, 'running') RETURNING id",
            params![label, Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    fn finish_run(&self, run_id: i64, totals: &RunTotals, error: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"UPDATE harvest_runs SET
               finished_at = ?, status = ?,
               sessions_total = ?, sessions_failed = ?,
               records_committed = ?, rows_skipped = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_some() { "error" } else { totals.status() },
                totals.sessions_total as i64,
                totals.sessions_failed as i64,
                totals.records_committed as i64,
                totals.rows_skipped as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }
}
