//! Combines per-source record lists into one deduplicated sequence.
//!
//! Sources are applied in the caller's order and the later source wins on a
//! key collision. Output order is the order in which keys were first seen.

use crate::models::{FilingRecord, Source};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Records harvested from one source crawl.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source: Source,
    pub classifies_by_period: bool,
    pub records: Vec<FilingRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyMode {
    /// (company_code, fiscal_year, fiscal_quarter)
    Period,
    /// (company_code, filing_datetime)
    Dated,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MergeKey {
    Period { code: String, year: i32, quarter: u8 },
    Dated { code: String, filed_at: NaiveDateTime },
}

impl MergeKey {
    pub fn of(record: &FilingRecord, mode: KeyMode) -> Self {
        match mode {
            KeyMode::Period => MergeKey::Period {
                code: record.company_code.clone(),
                year: record.fiscal_year,
                quarter: record.fiscal_quarter,
            },
            KeyMode::Dated => MergeKey::Dated {
                code: record.company_code.clone(),
                filed_at: record.filing_datetime,
            },
        }
    }
}

impl fmt::Display for MergeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeKey::Period { code, year, quarter } => write!(f, "{code} FY{year} Q{quarter}"),
            MergeKey::Dated { code, filed_at } => write!(f, "{code} @ {filed_at}"),
        }
    }
}

/// Two sources reported the same key. Resolved in favour of `winner`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConflict {
    pub key: String,
    pub winner: Source,
    pub overwritten: Source,
    pub differing_fields: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub mode: KeyMode,
    pub records: Vec<FilingRecord>,
    pub conflicts: Vec<MergeConflict>,
}

fn differing_fields(a: &FilingRecord, b: &FilingRecord) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if a.company_name != b.company_name {
        fields.push("company_name");
    }
    if a.title != b.title {
        fields.push("title");
    }
    if a.document_url != b.document_url {
        fields.push("document_url");
    }
    if a.filing_datetime != b.filing_datetime {
        fields.push("filing_datetime");
    }
    if (a.fiscal_year, a.fiscal_quarter) != (b.fiscal_year, b.fiscal_quarter) {
        fields.push("fiscal_period");
    }
    if a.report_type != b.report_type {
        fields.push("report_type");
    }
    fields
}

/// Period keys when every contributing batch classifies by period, datetime
/// keys otherwise. Empty batches do not vote.
pub fn key_mode(batches: &[SourceBatch]) -> KeyMode {
    if batches
        .iter()
        .filter(|b| !b.records.is_empty())
        .all(|b| b.classifies_by_period)
    {
        KeyMode::Period
    } else {
        KeyMode::Dated
    }
}

/// Merge batches in `order`. Sources missing from `order` are applied first,
/// so any listed source outranks them.
pub fn merge_sources(mut batches: Vec<SourceBatch>, order: &[Source]) -> MergeOutcome {
    let rank = |s: Source| order.iter().position(|o| *o == s).map_or(0, |p| p + 1);
    batches.sort_by_key(|b| rank(b.source));

    let mode = key_mode(&batches);
    let mut index: HashMap<MergeKey, usize> = HashMap::new();
    let mut records: Vec<FilingRecord> = Vec::new();
    let mut conflicts = Vec::new();

    for batch in batches {
        for record in batch.records {
            let key = MergeKey::of(&record, mode);
            let Some(&slot) = index.get(&key) else {
                index.insert(key, records.len());
                records.push(record);
                continue;
            };

            let existing = &records[slot];
            if existing.source != record.source {
                let conflict = MergeConflict {
                    key: key.to_string(),
                    winner: record.source,
                    overwritten: existing.source,
                    differing_fields: differing_fields(existing, &record),
                };
                info!(
                    "Merge conflict on {}: {} overwrites {} ({})",
                    conflict.key,
                    conflict.winner,
                    conflict.overwritten,
                    if conflict.differing_fields.is_empty() {
                        "identical".to_string()
                    } else {
                        conflict.differing_fields.join(", ")
                    }
                );
                conflicts.push(conflict);
            } else {
                debug!("Duplicate {} within {}; keeping the later row", key, record.source);
            }
            records[slot] = record;
        }
    }

    MergeOutcome { mode, records, conflicts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReportType;
    use chrono::NaiveDate;
    use url::Url;

    fn record(source: Source, code: &str, title: &str, quarter: u8) -> FilingRecord {
        FilingRecord {
            company_code: code.to_string(),
            company_name: "テスト".to_string(),
            title: title.to_string(),
            document_url: Url::parse(&format!("https://{}.example/{code}.pdf", source.as_str())).unwrap(),
            source,
            filing_datetime: NaiveDate::from_ymd_opt(2024, 2, 1)
                .unwrap()
                .and_hms_opt(15, 0, 0)
                .unwrap(),
            fiscal_year: 2024,
            fiscal_quarter: quarter,
            report_type: ReportType::from_title(title),
        }
    }

    fn batch(source: Source, records: Vec<FilingRecord>) -> SourceBatch {
        SourceBatch { source, classifies_by_period: true, records }
    }

    fn scenario_a() -> Vec<SourceBatch> {
        vec![
            batch(
                Source::RegistryA,
                vec![record(Source::RegistryA, "1234", "2024年3月期 第3四半期決算短信", 3)],
            ),
            batch(
                Source::RegistryB,
                vec![record(Source::RegistryB, "1234", "2024年3月期 第3四半期決算説明資料", 3)],
            ),
        ]
    }

    #[test]
    fn later_source_wins_on_collision() {
        let out = merge_sources(scenario_a(), &[Source::RegistryA, Source::RegistryB]);
        assert_eq!(out.mode, KeyMode::Period);
        assert_eq!(out.records.len(), 1);
        let merged = &out.records[0];
        assert_eq!(merged.fiscal_quarter, 3);
        assert_eq!(merged.source, Source::RegistryB);
        assert_eq!(merged.title, "2024年3月期 第3四半期決算説明資料");
        assert_eq!(merged.report_type, ReportType::ExplanatoryMaterial);

        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].winner, Source::RegistryB);
        assert!(out.conflicts[0].differing_fields.contains(&"title"));
    }

    #[test]
    fn caller_order_decides_precedence() {
        let out = merge_sources(scenario_a(), &[Source::RegistryB, Source::RegistryA]);
        assert_eq!(out.records[0].source, Source::RegistryA);
    }

    #[test]
    fn merge_is_idempotent() {
        let order = [Source::RegistryA, Source::RegistryB];
        let once = merge_sources(scenario_a(), &order);
        let twice = merge_sources(scenario_a(), &order);
        assert_eq!(once.records, twice.records);

        let remerged = merge_sources(
            vec![SourceBatch {
                source: Source::RegistryB,
                classifies_by_period: true,
                records: once.records.clone(),
            }],
            &order,
        );
        assert_eq!(remerged.records, once.records);
    }

    #[test]
    fn order_is_stable_by_first_seen_key() {
        let a = batch(
            Source::CompanySite,
            vec![
                record(Source::CompanySite, "1111", "2024年3月期 第1四半期決算短信", 1),
                record(Source::CompanySite, "2222", "2024年3月期 第1四半期決算短信", 1),
            ],
        );
        let b = batch(
            Source::RegistryA,
            vec![
                record(Source::RegistryA, "3333", "2024年3月期 第1四半期決算短信", 1),
                record(Source::RegistryA, "1111", "2024年3月期 第1四半期決算短信", 1),
            ],
        );
        let out = merge_sources(vec![b, a], &[Source::CompanySite, Source::RegistryA]);
        let codes: Vec<_> = out.records.iter().map(|r| r.company_code.as_str()).collect();
        assert_eq!(codes, ["1111", "2222", "3333"]);
        assert_eq!(out.records[0].source, Source::RegistryA);
    }

    #[test]
    fn non_period_source_switches_to_datetime_keys() {
        let mut news = batch(
            Source::NewsSite,
            vec![record(Source::NewsSite, "1234", "2024年3月期 第3四半期決算短信", 3)],
        );
        news.classifies_by_period = false;
        let mut later = record(Source::RegistryA, "1234", "2024年3月期 第3四半期決算説明資料", 3);
        later.filing_datetime = later.filing_datetime + chrono::Duration::hours(1);
        let registry = batch(Source::RegistryA, vec![later]);

        let out = merge_sources(vec![news, registry], &[Source::NewsSite, Source::RegistryA]);
        assert_eq!(out.mode, KeyMode::Dated);
        assert_eq!(out.records.len(), 2);
        assert!(out.conflicts.is_empty());
    }
}
