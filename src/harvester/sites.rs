//! Per-site adapters. Every site shares the locator, extractor, classifier
//! and merger; an adapter only supplies where to start and what the listing
//! looks like.

use super::error::HarvestError;
use super::row_extractor::RowRules;
use crate::config::SiteConfig;
use crate::models::{CompanyTarget, DateRange, Source};
use url::Url;

pub trait SiteAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Human-readable unit-of-work name, e.g. `registry-a` or `company-site:7203`.
    fn label(&self) -> String;

    fn entry_url(&self, range: &DateRange) -> Result<Url, HarvestError>;

    fn required_headers(&self) -> &[String];

    fn row_rules(&self) -> RowRules<'_>;

    fn next_page_labels(&self) -> &[String];

    /// Rows are listed newest first, so a page entirely before the window
    /// means every later page is too.
    fn date_ordered(&self) -> bool;

    fn classifies_by_period(&self) -> bool;
}

/// A site described entirely by its [`SiteConfig`].
#[derive(Debug, Clone)]
pub struct ConfiguredSite {
    config: SiteConfig,
    base_url: Url,
    company: Option<CompanyTarget>,
}

impl ConfiguredSite {
    pub fn new(config: SiteConfig) -> Result<Self, HarvestError> {
        if config.base_url.contains("{ir_url}") || config.entry_url.contains("{ir_url}") {
            return Err(HarvestError::InvalidSite(format!(
                "{} is defined per company; use ConfiguredSite::for_company",
                config.source
            )));
        }
        let base_url = parse_url(&config, &config.base_url)?;
        Ok(Self { config, base_url, company: None })
    }

    /// Bind a per-company site definition (`{ir_url}`, `{code}`) to one target.
    pub fn for_company(mut config: SiteConfig, target: &CompanyTarget) -> Result<Self, HarvestError> {
        config.base_url = fill_company(&config.base_url, target);
        config.entry_url = fill_company(&config.entry_url, target);
        let base_url = parse_url(&config, &config.base_url)?;
        Ok(Self {
            config,
            base_url,
            company: Some(target.clone()),
        })
    }
}

fn fill_company(template: &str, target: &CompanyTarget) -> String {
    template
        .replace("{ir_url}", target.ir_url.as_str())
        .replace("{code}", &target.code)
}

fn parse_url(config: &SiteConfig, raw: &str) -> Result<Url, HarvestError> {
    Url::parse(raw).map_err(|e| HarvestError::InvalidSite(format!("{}: {raw:?}: {e}", config.source)))
}

impl SiteAdapter for ConfiguredSite {
    fn source(&self) -> Source {
        self.config.source
    }

    fn label(&self) -> String {
        match &self.company {
            Some(target) => format!("{}:{}", self.config.source, target.code),
            None => self.config.source.to_string(),
        }
    }

    fn entry_url(&self, range: &DateRange) -> Result<Url, HarvestError> {
        let mut url = self
            .config
            .entry_url
            .replace("{start}", &range.start.format("%Y%m%d").to_string())
            .replace("{end}", &range.end.format("%Y%m%d").to_string());
        if let Some(target) = &self.company {
            url = fill_company(&url, target);
        }
        parse_url(&self.config, &url)
    }

    fn required_headers(&self) -> &[String] {
        &self.config.required_headers
    }

    fn row_rules(&self) -> RowRules<'_> {
        RowRules {
            layout: &self.config.layout,
            base_url: &self.base_url,
            relevance_keywords: &self.config.relevance_keywords,
            company: self.company.as_ref(),
        }
    }

    fn next_page_labels(&self) -> &[String] {
        &self.config.next_page_labels
    }

    fn date_ordered(&self) -> bool {
        self.config.date_ordered
    }

    fn classifies_by_period(&self) -> bool {
        self.config.classifies_by_period
    }
}
