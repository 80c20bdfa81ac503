use crate::browser::BrowserError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Failures that end (part of) a crawl session.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("{action} failed after {attempts} attempt(s): {source}")]
    TransientNavigation {
        action: String,
        attempts: u32,
        #[source]
        source: BrowserError,
    },

    #[error("page structure not as expected: {what}")]
    StructuralParse { what: String },

    #[error("{action} cancelled")]
    Cancelled { action: String },

    #[error("site definition invalid: {0}")]
    InvalidSite(String),
}

impl HarvestError {
    pub fn structural(what: impl Into<String>) -> Self {
        HarvestError::StructuralParse { what: what.into() }
    }
}

// Skips

/// Why a row did not become a record. Not an error: counted and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    NoRelevanceKeyword,
    MissingCells,
    StaleRow,
    MissingLink,
    MissingCode,
    InvalidDate,
    Unclassified,
    OutOfRange,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NoRelevanceKeyword => "no relevance keyword",
            SkipReason::MissingCells => "missing cells",
            SkipReason::StaleRow => "stale row",
            SkipReason::MissingLink => "missing link",
            SkipReason::MissingCode => "missing code",
            SkipReason::InvalidDate => "invalid date",
            SkipReason::Unclassified => "unclassified title",
            SkipReason::OutOfRange => "outside date range",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub no_relevance_keyword: usize,
    pub missing_cells: usize,
    pub stale_row: usize,
    pub missing_link: usize,
    pub missing_code: usize,
    pub invalid_date: usize,
    pub unclassified: usize,
    pub out_of_range: usize,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        let slot = match reason {
            SkipReason::NoRelevanceKeyword => &mut self.no_relevance_keyword,
            SkipReason::MissingCells => &mut self.missing_cells,
            SkipReason::StaleRow => &mut self.stale_row,
            SkipReason::MissingLink => &mut self.missing_link,
            SkipReason::MissingCode => &mut self.missing_code,
            SkipReason::InvalidDate => &mut self.invalid_date,
            SkipReason::Unclassified => &mut self.unclassified,
            SkipReason::OutOfRange => &mut self.out_of_range,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.no_relevance_keyword
            + self.missing_cells
            + self.stale_row
            + self.missing_link
            + self.missing_code
            + self.invalid_date
            + self.unclassified
            + self.out_of_range
    }

    pub fn absorb(&mut self, other: &SkipCounts) {
        self.no_relevance_keyword += other.no_relevance_keyword;
        self.missing_cells += other.missing_cells;
        self.stale_row += other.stale_row;
        self.missing_link += other.missing_link;
        self.missing_code += other.missing_code;
        self.invalid_date += other.invalid_date;
        self.unclassified += other.unclassified;
        self.out_of_range += other.out_of_range;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_counts_accumulate_by_reason() {
        let mut a = SkipCounts::default();
        a.record(SkipReason::Unclassified);
        a.record(SkipReason::Unclassified);
        a.record(SkipReason::StaleRow);
        let mut b = SkipCounts::default();
        b.record(SkipReason::NoRelevanceKeyword);
        a.absorb(&b);
        assert_eq!(a.unclassified, 2);
        assert_eq!(a.no_relevance_keyword, 1);
        assert_eq!(a.total(), 4);
    }
}
