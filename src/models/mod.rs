use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

// Source

/// Disclosure site a record was harvested from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    RegistryA,
    RegistryB,
    CompanySite,
    NewsSite,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::RegistryA,
        Source::RegistryB,
        Source::CompanySite,
        Source::NewsSite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::RegistryA => "registry-a",
            Source::RegistryB => "registry-b",
            Source::CompanySite => "company-site",
            Source::NewsSite => "news-site",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|src| src.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown source {:?}", s))
    }
}

// Report type

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    ShortFormEarnings,
    ExplanatoryMaterial,
    AnnualReport,
    Unclassified,
}

impl ReportType {
    /// Derive the document kind from its listing title.
    /// "2024年3月期 第3四半期決算短信" → ShortFormEarnings
    pub fn from_title(title: &str) -> Self {
        let lower = title.to_lowercase();
        if title.contains("決算短信") {
            ReportType::ShortFormEarnings
        } else if title.contains("決算説明資料") || title.contains("説明会資料") {
            ReportType::ExplanatoryMaterial
        } else if title.contains("有価証券報告書")
            || title.contains("統合報告書")
            || lower.contains("annual report")
        {
            ReportType::AnnualReport
        } else {
            ReportType::Unclassified
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::ShortFormEarnings => "short-form-earnings",
            ReportType::ExplanatoryMaterial => "explanatory-material",
            ReportType::AnnualReport => "annual-report",
            ReportType::Unclassified => "unclassified",
        }
    }
}

impl FromStr for ReportType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "short-form-earnings" => Ok(ReportType::ShortFormEarnings),
            "explanatory-material" => Ok(ReportType::ExplanatoryMaterial),
            "annual-report" => Ok(ReportType::AnnualReport),
            "unclassified" => Ok(ReportType::Unclassified),
            other => Err(anyhow::anyhow!("unknown report type {:?}", other)),
        }
    }
}

// Filing record

/// One disclosure document reference, ready for the persistence sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilingRecord {
    pub company_code: String,
    pub company_name: String,
    pub title: String,
    pub document_url: Url,
    pub source: Source,
    pub filing_datetime: NaiveDateTime,
    pub fiscal_year: i32,
    pub fiscal_quarter: u8, // 4 = annual
    pub report_type: ReportType,
}

impl FilingRecord {
    pub fn filing_date(&self) -> NaiveDate {
        self.filing_datetime.date()
    }
}

/// Fiscal period a title was classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiscalPeriod {
    pub year: i32,
    pub quarter: u8,
}

// Date window

/// Inclusive `[start, end]` filing-date window of one crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> anyhow::Result<Self> {
        if start > end {
            anyhow::bail!("date range start {} is after end {}", start, end);
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn precedes(&self, date: NaiveDate) -> bool {
        date < self.start
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

// Raw rows

/// Candidate extracted from one result row, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFilingRow {
    pub filed_at: NaiveDateTime,
    pub company_code: String,
    pub company_name: String,
    pub title: String,
    pub document_url: Url,
}

/// One company whose IR pages are crawled individually.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyTarget {
    pub code: String,
    pub name: String,
    pub ir_url: Url,
}
