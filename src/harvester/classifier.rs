//! Fiscal period classification of free-text filing titles.
//!
//! Rules, first match wins:
//! 1. `<yyyy>年 … 第<q>四半期` → quarter `q`
//! 2. `<yyyy>年 … 期 … (決算|通期|期末)` → annual, quarter 4
//!
//! Anything else is unclassified. A rule-1 match with a quarter digit outside
//! 1-4 is unclassified too; it does not fall through to rule 2.
//!
//! Filing-registry titles number the business term instead of naming a year
//! ("有価証券報告書－第86期(2023/04/01－2024/03/31)"). For those,
//! [`classify_filing`] falls back to two more rules and takes the year from
//! the filing date:
//! 3. `第<n>期 … 第<q>四半期` → quarter `q`
//! 4. `第<n>期` next to `有価証券報告書` → annual, quarter 4

use super::cleaner::normalize_title;
use super::error::SkipReason;
use crate::models::{FilingRecord, FiscalPeriod, RawFilingRow, ReportType, Source};
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::sync::LazyLock;

static RE_QUARTERLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})年.*?第(\d)四半期").expect("invalid regex: quarterly title")
});

static RE_ANNUAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})年.*?期.*?(決算|通期|期末)").expect("invalid regex: annual title")
});

static RE_TERM_QUARTERLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"第\d+期.*?第(\d)四半期").expect("invalid regex: term quarterly title")
});

static RE_TERM_ANNUAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"第\d+期\s*有価証券報告書|有価証券報告書.*?第\d+期")
        .expect("invalid regex: term annual title")
});

const YEARS: std::ops::RangeInclusive<i32> = 1900..=2100;

pub fn classify_title(title: &str) -> Option<FiscalPeriod> {
    let title = normalize_title(title);

    if let Some(caps) = RE_QUARTERLY.captures(&title) {
        let year: i32 = caps[1].parse().ok()?;
        let quarter: u8 = caps[2].parse().ok()?;
        return (YEARS.contains(&year) && (1..=4).contains(&quarter))
            .then_some(FiscalPeriod { year, quarter });
    }

    if let Some(caps) = RE_ANNUAL.captures(&title) {
        let year: i32 = caps[1].parse().ok()?;
        return YEARS
            .contains(&year)
            .then_some(FiscalPeriod { year, quarter: 4 });
    }

    None
}

/// [`classify_title`], then the term-numbered registry forms dated by `filed`.
pub fn classify_filing(title: &str, filed: NaiveDate) -> Option<FiscalPeriod> {
    if let Some(period) = classify_title(title) {
        return Some(period);
    }

    let title = normalize_title(title);
    let year = filed.year();
    if let Some(caps) = RE_TERM_QUARTERLY.captures(&title) {
        let quarter: u8 = caps[1].parse().ok()?;
        return (1..=4).contains(&quarter).then_some(FiscalPeriod { year, quarter });
    }
    RE_TERM_ANNUAL
        .is_match(&title)
        .then_some(FiscalPeriod { year, quarter: 4 })
}

/// Turn a raw row into a record, or drop it. Nothing without a valid fiscal
/// period or company code gets past this point.
pub fn classify_row(raw: RawFilingRow, source: Source) -> Result<FilingRecord, SkipReason> {
    if raw.company_code.is_empty() {
        return Err(SkipReason::MissingCode);
    }
    let period = classify_filing(&raw.title, raw.filed_at.date()).ok_or(SkipReason::Unclassified)?;

    Ok(FilingRecord {
        report_type: ReportType::from_title(&raw.title),
        company_code: raw.company_code,
        company_name: raw.company_name,
        title: raw.title,
        document_url: raw.document_url,
        source,
        filing_datetime: raw.filed_at,
        fiscal_year: period.year,
        fiscal_quarter: period.quarter,
    })
}
