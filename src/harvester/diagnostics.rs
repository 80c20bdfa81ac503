use crate::browser::BrowsingContext;
use crate::config::DiagnosticsConfig;
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Files written for one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub dom: PathBuf,
    pub screenshot: Option<PathBuf>,
}

/// Writes DOM + screenshot pairs for postmortem. Capturing never fails the
/// caller; problems are logged and swallowed.
#[derive(Debug, Clone)]
pub struct DiagnosticsRecorder {
    dir: Option<PathBuf>,
}

impl DiagnosticsRecorder {
    pub fn new(config: &DiagnosticsConfig) -> Self {
        if config.enabled {
            Self::to_dir(&config.dir)
        } else {
            Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn to_dir(dir: &Path) -> Self {
        Self { dir: Some(dir.to_path_buf()) }
    }

    pub async fn capture<C>(&self, ctx: &C, label: &str) -> Option<Snapshot>
    where
        C: BrowsingContext + ?Sized,
    {
        let dir = self.dir.as_ref()?;
        match self.write(dir, ctx, label).await {
            Ok(snapshot) => {
                info!("Saved diagnostics snapshot to {:?}", snapshot.dom);
                Some(snapshot)
            }
            Err(e) => {
                warn!("Could not save diagnostics for {}: {:#}", label, e);
                None
            }
        }
    }

    async fn write<C>(&self, dir: &Path, ctx: &C, label: &str) -> anyhow::Result<Snapshot>
    where
        C: BrowsingContext + ?Sized,
    {
        tokio::fs::create_dir_all(dir).await?;

        let stem = format!("{}_{}", sanitize(label), Local::now().format("%Y%m%dT%H%M%S%.3f"));

        let dom_path = dir.join(format!("{stem}.html"));
        let url = ctx.current_url().map(|u| u.to_string()).unwrap_or_default();
        let source = ctx.page_source().await.unwrap_or_else(|e| format!("<!-- page source unavailable: {e} -->"));
        tokio::fs::write(&dom_path, format!("<!-- {url} -->\n{source}")).await?;

        let screenshot = match ctx.screenshot().await {
            Ok(Some(png)) => {
                let path = dir.join(format!("{stem}.png"));
                tokio::fs::write(&path, png).await?;
                Some(path)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Screenshot failed for {}: {}", label, e);
                None
            }
        };

        Ok(Snapshot { dom: dom_path, screenshot })
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
