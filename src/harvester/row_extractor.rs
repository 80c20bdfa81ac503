use super::cleaner::{normalize_code, normalize_digits, normalize_title, parse_listing_date, parse_listing_datetime};
use super::error::SkipReason;
use crate::browser::Cell;
use crate::config::RowLayout;
use crate::models::{CompanyTarget, RawFilingRow};
use chrono::NaiveDate;
use url::Url;

/// Per-site rules for reading one result row.
#[derive(Debug, Clone)]
pub struct RowRules<'a> {
    pub layout: &'a RowLayout,
    pub base_url: &'a Url,
    pub relevance_keywords: &'a [String],
    /// Supplies code/name when the listing has no such columns.
    pub company: Option<&'a CompanyTarget>,
}

impl RowRules<'_> {
    fn is_relevant(&self, title: &str) -> bool {
        self.relevance_keywords.is_empty()
            || self.relevance_keywords.iter().any(|k| title.contains(k.as_str()))
    }
}

fn cell_text(cells: &[Cell], index: Option<usize>) -> Option<&str> {
    index.and_then(|i| cells.get(i)).map(|c| c.text.trim())
}

/// Listing date of a row, read independently of relevance and links. Used to
/// tell whether a whole page lies before the crawl window.
pub fn row_date(cells: &[Cell], layout: &RowLayout) -> Option<NaiveDate> {
    let cell = normalize_digits(cell_text(cells, Some(layout.date))?);
    parse_listing_date(cell.split_whitespace().next()?)
}

/// Read one row's fixed-position cells into a candidate record.
pub fn extract_row(cells: &[Cell], rules: &RowRules<'_>) -> Result<RawFilingRow, SkipReason> {
    let layout = rules.layout;
    if cells.len() < layout.min_cells() {
        return Err(SkipReason::MissingCells);
    }

    let title_cell = &cells[layout.title];
    let anchor = title_cell.anchors.iter().find(|a| a.href.is_some());
    let title = anchor
        .map(|a| a.text.as_str())
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(title_cell.text.as_str())
        .trim();

    // Stored as listed; only the relevance check and classification normalize.
    if !rules.is_relevant(&normalize_title(title)) {
        return Err(SkipReason::NoRelevanceKeyword);
    }

    let href = anchor
        .and_then(|a| a.href.as_deref())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(SkipReason::MissingLink)?;
    // Absolute hrefs pass through `join` unchanged.
    let document_url = rules.base_url.join(href).map_err(|_| SkipReason::MissingLink)?;

    let date_cell = cell_text(cells, Some(layout.date)).unwrap_or_default();
    let filed_at = parse_listing_datetime(date_cell, cell_text(cells, layout.time))
        .ok_or(SkipReason::InvalidDate)?;

    let company_code = match layout.code {
        Some(_) => cell_text(cells, layout.code).and_then(normalize_code),
        None => rules.company.map(|c| c.code.clone()),
    }
    .ok_or(SkipReason::MissingCode)?;

    let company_name = cell_text(cells, layout.company)
        .map(str::to_string)
        .or_else(|| rules.company.map(|c| c.name.clone()))
        .unwrap_or_default();

    Ok(RawFilingRow {
        filed_at,
        company_code,
        company_name,
        title: title.to_string(),
        document_url,
    })
}
