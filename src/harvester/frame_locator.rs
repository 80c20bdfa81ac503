//! Finds the results table somewhere in a nested frame tree.
//!
//! The search is an explicit depth-first walk over a stack of [`FrameNode`]s.
//! The stack mirrors the context's current frame path, so the only context
//! operations needed are "enter child i" and "leave to parent". Each frame's
//! own tables are scanned before any of its children, and the walk stops at
//! the first match, leaving later siblings unvisited and the context parked
//! in the matching frame.

use super::error::HarvestError;
use super::retry::RetryController;
use crate::browser::{BrowserError, BrowsingContext, TableHandle};
use crate::config::LocatorConfig;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use url::Url;

/// The matched table plus the child-frame indices leading to it from the root.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedTable {
    pub frame_path: Vec<usize>,
    pub table: TableHandle,
}

/// Traversal state of one frame on the search stack. Its parent is the entry
/// below it.
#[derive(Debug, Default)]
struct FrameNode {
    depth: usize,
    /// `None` until the frame's own tables have been scanned.
    child_count: Option<usize>,
    next_child: usize,
    visited_without_match: bool,
}

/// True when every required label appears in some header cell.
pub fn headers_match(headers: &[String], required: &[String]) -> bool {
    required.iter().all(|label| {
        headers
            .iter()
            .any(|h| h.trim() == label.as_str() || h.contains(label.as_str()))
    })
}

#[derive(Debug, Clone)]
pub struct FrameLocator {
    required_headers: Vec<String>,
    max_depth: usize,
    attempts: u32,
    reload_interval: Duration,
    load_timeout: Duration,
}

impl FrameLocator {
    pub fn new(required_headers: Vec<String>, config: &LocatorConfig, load_timeout: Duration) -> Self {
        Self {
            required_headers,
            max_depth: config.max_depth,
            attempts: config.attempts.max(1),
            reload_interval: Duration::from_millis(config.reload_interval_ms),
            load_timeout,
        }
    }

    async fn matching_table<C>(&self, ctx: &C) -> Result<Option<TableHandle>, BrowserError>
    where
        C: BrowsingContext + ?Sized,
    {
        Ok(ctx
            .tables()
            .await?
            .into_iter()
            .find(|t| headers_match(&t.headers, &self.required_headers)))
    }

    /// One full search of the currently loaded document, starting at the root.
    /// On error the context is put back at the root before returning.
    pub async fn search<C>(&self, ctx: &C) -> Result<Option<LocatedTable>, BrowserError>
    where
        C: BrowsingContext + ?Sized,
    {
        ctx.switch_to_root().await?;
        match self.walk(ctx).await {
            Ok(found) => Ok(found),
            Err(e) => {
                if let Err(reset) = ctx.switch_to_root().await {
                    warn!("Could not return to root frame after search error: {}", reset);
                }
                Err(e)
            }
        }
    }

    async fn walk<C>(&self, ctx: &C) -> Result<Option<LocatedTable>, BrowserError>
    where
        C: BrowsingContext + ?Sized,
    {
        let mut stack = vec![FrameNode::default()];
        let mut path: Vec<usize> = Vec::new();

        while let Some(top) = stack.len().checked_sub(1) {
            if stack[top].child_count.is_none() {
                if let Some(table) = self.matching_table(ctx).await? {
                    debug!("Results table found at frame path {:?}", path);
                    return Ok(Some(LocatedTable { frame_path: path, table }));
                }
                let count = if stack[top].depth < self.max_depth {
                    ctx.child_frame_count().await?
                } else {
                    trace!("Depth limit {} reached at {:?}", self.max_depth, path);
                    0
                };
                stack[top].child_count = Some(count);
            }

            let node = &mut stack[top];
            if node.next_child < node.child_count.unwrap_or(0) {
                let index = node.next_child;
                node.next_child += 1;
                let depth = node.depth + 1;

                match ctx.enter_child_frame(index).await {
                    Ok(()) => {
                        path.push(index);
                        stack.push(FrameNode { depth, ..FrameNode::default() });
                    }
                    // A frame that cannot be entered is treated as empty.
                    Err(e) if !e.is_transient() => {
                        debug!("Skipping child frame {} of {:?}: {}", index, path, e);
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            node.visited_without_match = true;
            trace!(
                depth = node.depth,
                visited_without_match = node.visited_without_match,
                "Frame {:?} exhausted",
                path
            );
            stack.pop();
            if stack.is_empty() {
                break;
            }
            path.pop();
            if let Err(e) = ctx.leave_to_parent().await {
                warn!("leave_to_parent failed ({}), replaying path {:?}", e, path);
                replay_path(ctx, &path).await?;
            }
        }

        Ok(None)
    }

    /// Search the current document, retrying transient failures.
    pub async fn find<C>(&self, ctx: &C, retry: &RetryController) -> Result<Option<LocatedTable>, HarvestError>
    where
        C: BrowsingContext + ?Sized,
    {
        retry.run(ctx, "frame search", || self.search(ctx)).await
    }

    /// Load `entry` and search; reload and search again up to the configured
    /// number of attempts. Exhaustion is structural and leaves a snapshot.
    pub async fn locate<C>(&self, ctx: &C, entry: &Url, retry: &RetryController) -> Result<LocatedTable, HarvestError>
    where
        C: BrowsingContext + ?Sized,
    {
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                retry.pause(self.reload_interval, "reload delay").await?;
            }
            retry.run(ctx, "navigate", || ctx.navigate(entry)).await?;
            retry
                .run(ctx, "wait for load", || ctx.wait_until_loaded(self.load_timeout))
                .await?;

            if let Some(found) = self.find(ctx, retry).await? {
                info!("Located results table at frame path {:?} (attempt {})", found.frame_path, attempt);
                return Ok(found);
            }
            warn!("No results table on attempt {}/{} for {}", attempt, self.attempts, entry);
        }

        let what = format!(
            "no table with headers {:?} after {} attempt(s)",
            self.required_headers, self.attempts
        );
        Err(retry.fail_structural(ctx, &what).await)
    }

    /// After a page change, walk straight back down the known frame path and
    /// look for the table there. `None` if the path or table no longer exists.
    pub async fn reacquire<C>(&self, ctx: &C, frame_path: &[usize]) -> Result<Option<TableHandle>, BrowserError>
    where
        C: BrowsingContext + ?Sized,
    {
        match replay_path(ctx, frame_path).await {
            Ok(()) => self.matching_table(ctx).await,
            Err(BrowserError::NoSuchFrame(i)) => {
                debug!("Frame path {:?} gone at index {}", frame_path, i);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Switch to the root frame and descend through `path`.
pub async fn replay_path<C>(ctx: &C, path: &[usize]) -> Result<(), BrowserError>
where
    C: BrowsingContext + ?Sized,
{
    ctx.switch_to_root().await?;
    for &index in path {
        ctx.enter_child_frame(index).await?;
    }
    Ok(())
}
