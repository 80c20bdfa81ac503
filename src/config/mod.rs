use crate::models::Source;
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub locator: LocatorConfig,

    #[serde(default)]
    pub pagination: PaginationConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_sources")]
    pub sources: Vec<SiteConfig>,
}

/// HTTP-backed browsing context settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_page_load_timeout_secs")]
    pub page_load_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Incremental,
}

/// Retry/diagnostics controller settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Whole-session budget; a hung session is aborted past this.
    #[serde(default = "default_session_deadline_secs")]
    pub session_deadline_secs: u64,
}

/// Frame locator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocatorConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_locate_attempts")]
    pub attempts: u32,

    #[serde(default = "default_reload_interval_ms")]
    pub reload_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaginationConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_diagnostics_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_delay_secs")]
    pub batch_delay_secs: u64,

    /// Sources are merged in this order; later entries win on key collision.
    #[serde(default = "default_merge_order")]
    pub merge_order: Vec<Source>,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Fixed cell positions of a result row.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RowLayout {
    pub date: usize,
    /// `None` when the date cell carries "date time".
    #[serde(default)]
    pub time: Option<usize>,
    /// `None` when the code comes from the crawl target instead of the row.
    #[serde(default)]
    pub code: Option<usize>,
    pub company: Option<usize>,
    pub title: usize,
}

impl RowLayout {
    /// Cells a row must have before any of them is read.
    pub fn min_cells(&self) -> usize {
        [Some(self.date), self.time, self.code, self.company, Some(self.title)]
            .into_iter()
            .flatten()
            .max()
            .map_or(0, |i| i + 1)
    }
}

/// One disclosure site the harvester can crawl.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub source: Source,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// May contain `{start}`, `{end}` (yyyymmdd) and `{code}`.
    pub entry_url: String,

    /// Relative document links resolve against this.
    pub base_url: String,

    pub required_headers: Vec<String>,

    pub layout: RowLayout,

    pub relevance_keywords: Vec<String>,

    pub next_page_labels: Vec<String>,

    /// Rows are listed newest first.
    #[serde(default = "default_true")]
    pub date_ordered: bool,

    #[serde(default = "default_true")]
    pub classifies_by_period: bool,
}

// Defaults

fn default_user_agent() -> String {
    "disclosure-harvester/0.1 (filing aggregation; contact: ops@localhost)".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    1500
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_page_load_timeout_secs() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff() -> BackoffKind {
    BackoffKind::Incremental
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_session_deadline_secs() -> u64 {
    900
}
fn default_max_depth() -> usize {
    6
}
fn default_locate_attempts() -> u32 {
    10
}
fn default_reload_interval_ms() -> u64 {
    5000
}
fn default_max_pages() -> usize {
    50
}
fn default_diagnostics_dir() -> PathBuf {
    PathBuf::from("logs/diagnostics")
}
fn default_concurrency() -> usize {
    3
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_delay_secs() -> u64 {
    30
}
fn default_merge_order() -> Vec<Source> {
    vec![
        Source::NewsSite,
        Source::CompanySite,
        Source::RegistryB,
        Source::RegistryA,
    ]
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/filings.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_sources() -> Vec<SiteConfig> {
    Source::ALL.into_iter().map(SiteConfig::preset).collect()
}

fn labels(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl SiteConfig {
    /// Built-in definition of each known site.
    pub fn preset(source: Source) -> Self {
        let relevance = labels(&["決算説明資料", "決算短信"]);
        match source {
            Source::RegistryA => Self {
                source,
                enabled: true,
                entry_url: "https://www.release.tdnet.info/index.html".to_string(),
                base_url: "https://www.release.tdnet.info".to_string(),
                required_headers: labels(&["時刻", "コード", "会社名", "表題"]),
                layout: RowLayout { date: 0, time: Some(1), code: Some(2), company: Some(3), title: 4 },
                relevance_keywords: relevance,
                next_page_labels: labels(&["次へ"]),
                date_ordered: true,
                classifies_by_period: true,
            },
            Source::RegistryB => Self {
                source,
                enabled: false,
                entry_url: "https://disclosure2.edinet-fsa.go.jp/week0010.aspx?from={start}&to={end}"
                    .to_string(),
                base_url: "https://disclosure2.edinet-fsa.go.jp".to_string(),
                required_headers: labels(&["提出日時", "コード", "提出者", "書類名"]),
                layout: RowLayout { date: 0, time: None, code: Some(1), company: Some(2), title: 3 },
                relevance_keywords: labels(&["有価証券報告書", "四半期報告書", "決算短信"]),
                next_page_labels: labels(&["次へ", "次のページ"]),
                date_ordered: true,
                classifies_by_period: true,
            },
            Source::CompanySite => Self {
                source,
                enabled: false,
                entry_url: "{ir_url}".to_string(),
                base_url: "{ir_url}".to_string(),
                required_headers: labels(&["日付", "タイトル"]),
                layout: RowLayout { date: 0, time: None, code: None, company: None, title: 1 },
                relevance_keywords: relevance,
                next_page_labels: labels(&["次へ", "Next"]),
                date_ordered: true,
                classifies_by_period: true,
            },
            Source::NewsSite => Self {
                source,
                enabled: false,
                entry_url: "https://kabutan.jp/disclosures/?date={end}".to_string(),
                base_url: "https://kabutan.jp".to_string(),
                required_headers: labels(&["日時", "コード", "銘柄名", "開示情報"]),
                layout: RowLayout { date: 0, time: None, code: Some(1), company: Some(2), title: 3 },
                relevance_keywords: relevance,
                next_page_labels: labels(&["次へ", "次>"]),
                date_ordered: true,
                classifies_by_period: false,
            },
        }
    }
}

// Loader

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("HARVEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().context("Invalid configuration")?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.pipeline.concurrency > 0, "pipeline.concurrency must be > 0");
        ensure!(self.pipeline.batch_size > 0, "pipeline.batch_size must be > 0");
        ensure!(self.pagination.max_pages > 0, "pagination.max_pages must be > 0");
        ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be > 0");
        ensure!(self.locator.attempts > 0, "locator.attempts must be > 0");

        for site in &self.sources {
            ensure!(
                !site.required_headers.is_empty(),
                "{}: required_headers is empty",
                site.source
            );
            ensure!(
                !site.next_page_labels.is_empty(),
                "{}: next_page_labels is empty",
                site.source
            );
            // Company sites are templated per target and checked when expanded.
            if site.source != Source::CompanySite {
                Url::parse(&site.base_url)
                    .with_context(|| format!("{}: invalid base_url", site.source))?;
            }
        }
        Ok(())
    }

    pub fn site(&self, source: Source) -> Option<&SiteConfig> {
        self.sources.iter().find(|s| s.source == source)
    }
}

impl BrowserConfig {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
            page_load_timeout_secs: default_page_load_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            session_deadline_secs: default_session_deadline_secs(),
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            attempts: default_locate_attempts(),
            reload_interval_ms: default_reload_interval_ms(),
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self { max_pages: default_max_pages() }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            dir: default_diagnostics_dir(),
            enabled: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay_secs(),
            merge_order: default_merge_order(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            browser: BrowserConfig::default(),
            retry: RetryConfig::default(),
            locator: LocatorConfig::default(),
            pagination: PaginationConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            sources: default_sources(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.locator.max_depth, 6);
        assert_eq!(cfg.locator.attempts, 10);
        assert_eq!(cfg.pipeline.batch_size, 10);
        assert_eq!(cfg.pipeline.batch_delay_secs, 30);
        assert_eq!(cfg.sources.len(), Source::ALL.len());
    }

    #[test]
    fn layout_min_cells_covers_highest_index() {
        let a = SiteConfig::preset(Source::RegistryA);
        assert_eq!(a.layout.min_cells(), 5);
        let c = SiteConfig::preset(Source::CompanySite);
        assert_eq!(c.layout.min_cells(), 2);
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[pipeline]\nconcurrency = 7\n[pagination]\nmax_pages = 4\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.pipeline.concurrency, 7);
        assert_eq!(cfg.pagination.max_pages, 4);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.sources.len(), 4);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.pipeline.concurrency = 0;
        assert!(cfg.validate().is_err());
    }
}
