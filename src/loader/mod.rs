//! CSV import/export of filing records and company target lists.

use crate::harvester::cleaner::{normalize_code, parse_scaled_amount};
use crate::models::{CompanyTarget, FilingRecord};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};
use url::Url;

/// Write records with a header row, one filing per line.
pub fn write_records(path: &Path, records: &[FilingRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Could not create {:?}", path))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    info!("Wrote {} filings to {:?}", records.len(), path);
    Ok(())
}

/// Read records previously written by [`write_records`]. Bad rows are logged
/// and skipped.
pub fn read_records(path: &Path) -> Result<Vec<FilingRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Could not open {:?}", path))?;

    let mut records = Vec::new();
    for (i, result) in reader.deserialize::<FilingRecord>().enumerate() {
        match result {
            Ok(r) if (1..=4).contains(&r.fiscal_quarter) && !r.company_code.is_empty() => records.push(r),
            Ok(r) => warn!(
                "Row {} in {:?}: invalid filing {} Q{}",
                i + 1,
                path,
                r.company_code,
                r.fiscal_quarter
            ),
            Err(e) => warn!("Row {} in {:?}: {}", i + 1, path, e),
        }
    }

    debug!("{:?}: {} filings loaded", path, records.len());
    Ok(records)
}

/// One line of a company list. `revenue` is optional and may carry a unit
/// suffix ("1,234百万", "3,500億円").
#[derive(Debug, Deserialize)]
struct CompanyRow {
    code: String,
    name: String,
    ir_url: Url,
    #[serde(default)]
    revenue: Option<String>,
}

/// Company list with `code,name,ir_url[,revenue]` columns. With `min_revenue`
/// set, companies below it or without a parseable revenue are left out.
pub fn read_companies(path: &Path, min_revenue: Option<f64>) -> Result<Vec<CompanyTarget>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Could not open {:?}", path))?;

    let mut companies = Vec::new();
    for (i, result) in reader.deserialize::<CompanyRow>().enumerate() {
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };
        let Some(code) = normalize_code(&row.code) else {
            warn!("Row {} in {:?}: bad code {:?}", i + 1, path, row.code);
            continue;
        };
        if let Some(min) = min_revenue {
            let revenue = row.revenue.as_deref().and_then(parse_scaled_amount);
            if !revenue.is_some_and(|r| r >= min) {
                debug!("{} {}: revenue {:?} below screen", code, row.name, row.revenue);
                continue;
            }
        }
        companies.push(CompanyTarget {
            code,
            name: row.name,
            ir_url: row.ir_url,
        });
    }

    info!("{} companies loaded from {:?}", companies.len(), path);
    Ok(companies)
}
