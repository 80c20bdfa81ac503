//! `BrowsingContext` backed by plain HTTP fetches.
//!
//! Every frame (`<frame src>` / `<iframe src>`) is fetched as its own document
//! and pushed on a frame stack, so frame switching behaves like a browser's
//! `switch_to.frame` / `parent_frame`. Activating a control loads its target
//! into the current frame, the way a link click navigates an iframe, and the
//! frame keeps showing that document when it is re-entered from the root.

use super::{Anchor, BrowserError, BrowsingContext, Cell, ControlHandle, RowHandle, TableHandle};
use crate::config::BrowserConfig;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};
use url::Url;

#[derive(Clone)]
struct Frame {
    url: Url,
    html: String,
}

#[derive(Default)]
struct State {
    frames: Vec<Frame>,
    /// Child index of each entered frame; `frames[1..]` pairs with this.
    path: Vec<usize>,
    /// Frames navigated in place by `activate`, keyed by frame path.
    navigated: HashMap<Vec<usize>, Frame>,
    generation: u64,
    closed: bool,
}

pub struct HttpBrowsingContext {
    inner: reqwest::Client,
    request_delay: Duration,
    jitter_ms: u64,
    state: Mutex<State>,
}

impl HttpBrowsingContext {
    pub fn new(config: &BrowserConfig) -> anyhow::Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()?;

        Ok(Self {
            inner,
            request_delay: Duration::from_millis(config.request_delay_ms),
            jitter_ms: config.jitter_ms,
            state: Mutex::new(State::default()),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, BrowserError> {
        let guard = self.state.lock().map_err(|_| BrowserError::Closed)?;
        if guard.closed {
            return Err(BrowserError::Closed);
        }
        Ok(guard)
    }

    /// Sleep for the configured delay + random jitter.
    async fn polite_delay(&self) {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::random::<u64>() % (self.jitter_ms + 1)
        };
        sleep(self.request_delay + Duration::from_millis(jitter)).await;
    }

    async fn fetch(&self, url: &Url) -> Result<String, BrowserError> {
        self.polite_delay().await;
        debug!("GET {}", url);
        let resp = self.inner.get(url.clone()).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }

    /// URL and HTML of the current frame, copied out so no lock is held
    /// across parsing or awaits.
    fn current(&self) -> Result<(Url, String, u64), BrowserError> {
        let state = self.state()?;
        let frame = state.frames.last().ok_or(BrowserError::NothingLoaded)?;
        Ok((frame.url.clone(), frame.html.clone(), state.generation))
    }

    fn check_generation(&self, generation: u64, what: &str) -> Result<(String, u64), BrowserError> {
        let (_, html, current) = self.current()?;
        if generation != current {
            return Err(BrowserError::StaleElement(what.to_string()));
        }
        Ok((html, current))
    }
}

// Document parsing

fn selector(css: &str) -> Result<Selector, BrowserError> {
    Selector::parse(css).map_err(|e| BrowserError::Selector(format!("{css}: {e:?}")))
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Child frame targets in document order, resolved against the frame URL.
pub fn frame_sources(html: &str, base: &Url) -> Result<Vec<Url>, BrowserError> {
    let doc = Html::parse_document(html);
    let sel = selector("frame[src], iframe[src]")?;
    Ok(doc
        .select(&sel)
        .filter_map(|el| el.value().attr("src"))
        .filter_map(|src| base.join(src).ok())
        .collect())
}

/// Header texts of every table: the `th` cells of its first header row.
pub fn table_headers(html: &str) -> Result<Vec<Vec<String>>, BrowserError> {
    let doc = Html::parse_document(html);
    let table_sel = selector("table")?;
    let tr_sel = selector("tr")?;
    let th_sel = selector("th")?;

    Ok(doc
        .select(&table_sel)
        .map(|table| {
            table
                .select(&tr_sel)
                .map(|tr| tr.select(&th_sel).map(|th| element_text(&th)).collect::<Vec<_>>())
                .find(|cells| !cells.is_empty())
                .unwrap_or_default()
        })
        .collect())
}

/// Data rows (rows with `td` cells) of the `table_index`-th table.
pub fn table_rows(html: &str, table_index: usize) -> Result<Vec<Vec<Cell>>, BrowserError> {
    let doc = Html::parse_document(html);
    let table_sel = selector("table")?;
    let tr_sel = selector("tr")?;
    let td_sel = selector("td")?;
    let a_sel = selector("a")?;

    let Some(table) = doc.select(&table_sel).nth(table_index) else {
        return Err(BrowserError::StaleElement(format!("table {table_index}")));
    };

    Ok(table
        .select(&tr_sel)
        .map(|tr| {
            tr.select(&td_sel)
                .map(|td| Cell {
                    text: element_text(&td),
                    anchors: td
                        .select(&a_sel)
                        .map(|a| Anchor {
                            text: element_text(&a),
                            href: a.value().attr("href").map(str::to_string),
                        })
                        .collect(),
                })
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect())
}

/// First enabled anchor whose text contains one of `labels`.
pub fn find_labelled_link(
    html: &str,
    labels: &[String],
) -> Result<Option<(String, String)>, BrowserError> {
    let doc = Html::parse_document(html);
    let a_sel = selector("a[href]")?;

    for a in doc.select(&a_sel) {
        let text = element_text(&a);
        let Some(label) = labels.iter().find(|l| text.contains(l.as_str())) else {
            continue;
        };
        let attrs = a.value();
        let disabled = attrs.classes().any(|c| c.eq_ignore_ascii_case("disabled"))
            || attrs.attr("aria-disabled") == Some("true");
        let href = attrs.attr("href").unwrap_or_default();
        if disabled || href.is_empty() || href.starts_with('#') {
            continue;
        }
        return Ok(Some((label.clone(), href.to_string())));
    }
    Ok(None)
}

// BrowsingContext impl

#[async_trait]
impl BrowsingContext for HttpBrowsingContext {
    async fn navigate(&self, url: &Url) -> Result<(), BrowserError> {
        drop(self.state()?);
        let html = self.fetch(url).await?;
        let mut state = self.state()?;
        state.frames = vec![Frame { url: url.clone(), html }];
        state.path.clear();
        state.navigated.clear();
        state.generation += 1;
        Ok(())
    }

    async fn wait_until_loaded(&self, _timeout: Duration) -> Result<(), BrowserError> {
        // A fetched document is complete by the time `fetch` returns.
        self.current().map(|_| ())
    }

    async fn switch_to_root(&self) -> Result<(), BrowserError> {
        let mut state = self.state()?;
        if state.frames.is_empty() {
            return Err(BrowserError::NothingLoaded);
        }
        state.frames.truncate(1);
        state.path.clear();
        state.generation += 1;
        Ok(())
    }

    async fn child_frame_count(&self) -> Result<usize, BrowserError> {
        let (url, html, _) = self.current()?;
        Ok(frame_sources(&html, &url)?.len())
    }

    async fn enter_child_frame(&self, index: usize) -> Result<(), BrowserError> {
        let (url, html, _) = self.current()?;
        let target = frame_sources(&html, &url)?
            .into_iter()
            .nth(index)
            .ok_or(BrowserError::NoSuchFrame(index))?;

        let child_path = {
            let state = self.state()?;
            let mut path = state.path.clone();
            path.push(index);
            path
        };
        let kept = self.state()?.navigated.get(&child_path).cloned();
        let child = match kept {
            Some(frame) => {
                trace!("entering frame {} -> {} (navigated)", index, frame.url);
                frame
            }
            None => {
                trace!("entering frame {} -> {}", index, target);
                let html = self.fetch(&target).await?;
                Frame { url: target, html }
            }
        };

        let mut state = self.state()?;
        state.frames.push(child);
        state.path = child_path;
        state.generation += 1;
        Ok(())
    }

    async fn leave_to_parent(&self) -> Result<(), BrowserError> {
        let mut state = self.state()?;
        if state.frames.len() <= 1 {
            return Err(BrowserError::AtRoot);
        }
        state.frames.pop();
        state.path.pop();
        state.generation += 1;
        Ok(())
    }

    async fn tables(&self) -> Result<Vec<TableHandle>, BrowserError> {
        let (_, html, generation) = self.current()?;
        Ok(table_headers(&html)?
            .into_iter()
            .enumerate()
            .map(|(index, headers)| TableHandle { generation, index, headers })
            .collect())
    }

    async fn rows(&self, table: &TableHandle) -> Result<Vec<RowHandle>, BrowserError> {
        let (html, generation) = self.check_generation(table.generation, "table")?;
        let count = table_rows(&html, table.index)?.len();
        Ok((0..count)
            .map(|index| RowHandle { generation, table: table.index, index })
            .collect())
    }

    async fn row_cells(&self, row: &RowHandle) -> Result<Vec<Cell>, BrowserError> {
        let (html, _) = self.check_generation(row.generation, "row")?;
        table_rows(&html, row.table)?
            .into_iter()
            .nth(row.index)
            .ok_or_else(|| BrowserError::StaleElement(format!("row {}", row.index)))
    }

    async fn find_control(&self, labels: &[String]) -> Result<Option<ControlHandle>, BrowserError> {
        let (_, html, generation) = self.current()?;
        Ok(find_labelled_link(&html, labels)?.map(|(label, href)| ControlHandle {
            generation,
            label,
            href: Some(href),
        }))
    }

    async fn activate(&self, control: &ControlHandle) -> Result<(), BrowserError> {
        self.check_generation(control.generation, "control")?;
        let href = control
            .href
            .as_deref()
            .ok_or_else(|| BrowserError::Unsupported(format!("control {:?} has no target", control.label)))?;
        let (base, _, _) = self.current()?;
        let target = base
            .join(href)
            .map_err(|e| BrowserError::Unsupported(format!("bad href {href}: {e}")))?;

        let html = self.fetch(&target).await?;
        let frame = Frame { url: target, html };
        let mut state = self.state()?;
        if state.path.is_empty() {
            // A top-level navigation resets every frame below it.
            state.navigated.clear();
            state.frames = vec![frame];
        } else {
            let path = state.path.clone();
            state.navigated.retain(|p, _| !p.starts_with(&path) || *p == path);
            state.navigated.insert(path, frame.clone());
            if let Some(last) = state.frames.last_mut() {
                *last = frame;
            }
        }
        state.generation += 1;
        Ok(())
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        self.current().map(|(_, html, _)| html)
    }

    async fn screenshot(&self) -> Result<Option<Vec<u8>>, BrowserError> {
        Ok(None)
    }

    fn current_url(&self) -> Option<Url> {
        let state = self.state.lock().ok()?;
        state.frames.last().map(|f| f.url.clone())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut state = self.state.lock().map_err(|_| BrowserError::Closed)?;
        state.frames.clear();
        state.path.clear();
        state.navigated.clear();
        state.closed = true;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::local_site::{LocalSite, paged_listing};
    use super::*;

    const ROOT: &str = r#"
        <html><body>
          <iframe src="menu.html"></iframe>
          <div><iframe name="list" src="/inbs/list_001.html"></iframe></div>
        </body></html>"#;

    const LIST: &str = r#"
        <table><tr><td>ignored layout table</td></tr></table>
        <table id="main-list-table">
          <tr><th>日付</th><th>時刻</th><th>コード</th><th>会社名</th><th>表題</th></tr>
          <tr>
            <td>2024/02/01</td><td>15:00</td><td>12340</td><td>テスト 株式会社</td>
            <td><a href="140120240201512345.pdf">2024年3月期 第3四半期決算短信</a></td>
          </tr>
        </table>
        <a class="disabled" href="list_000.html">前へ</a>
        <a href="list_002.html">次へ &gt;</a>"#;

    #[test]
    fn frame_sources_resolve_in_document_order() {
        let base = Url::parse("https://example.jp/index.html").unwrap();
        let srcs = frame_sources(ROOT, &base).unwrap();
        let as_str: Vec<_> = srcs.iter().map(Url::as_str).collect();
        assert_eq!(
            as_str,
            ["https://example.jp/menu.html", "https://example.jp/inbs/list_001.html"]
        );
    }

    #[test]
    fn table_headers_and_rows() {
        let headers = table_headers(LIST).unwrap();
        assert_eq!(headers.len(), 2);
        assert!(headers[0].is_empty());
        assert_eq!(headers[1], ["日付", "時刻", "コード", "会社名", "表題"]);

        let rows = table_rows(LIST, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][3].text, "テスト 株式会社");
        assert_eq!(rows[0][4].anchors[0].href.as_deref(), Some("140120240201512345.pdf"));
    }

    #[test]
    fn disabled_links_are_not_controls() {
        let prev = find_labelled_link(LIST, &["前へ".to_string()]).unwrap();
        assert!(prev.is_none());
        let next = find_labelled_link(LIST, &["次へ".to_string()]).unwrap();
        assert_eq!(next, Some(("次へ".to_string(), "list_002.html".to_string())));
    }

    fn quick_config() -> BrowserConfig {
        BrowserConfig { request_delay_ms: 0, jitter_ms: 0, ..BrowserConfig::default() }
    }

    async fn listing_cells(ctx: &HttpBrowsingContext) -> Vec<Vec<Cell>> {
        let tables = ctx.tables().await.unwrap();
        let listing = tables.iter().find(|t| t.headers.contains(&"表題".to_string())).unwrap();
        let mut out = Vec::new();
        for row in ctx.rows(listing).await.unwrap() {
            out.push(ctx.row_cells(&row).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn framed_pager_advances_and_old_rows_go_stale() {
        let site = LocalSite::serve(&paged_listing()).await;
        let ctx = HttpBrowsingContext::new(&quick_config()).unwrap();

        ctx.navigate(&site.url("index.html")).await.unwrap();
        assert_eq!(ctx.child_frame_count().await.unwrap(), 1);
        ctx.enter_child_frame(0).await.unwrap();

        let page_1 = listing_cells(&ctx).await;
        let codes: Vec<_> = page_1.iter().map(|c| c[2].text.as_str()).collect();
        assert_eq!(codes, ["12340", "56780"]);

        let tables = ctx.tables().await.unwrap();
        let old_row = ctx.rows(&tables[0]).await.unwrap().remove(0);

        let next = ctx.find_control(&["次へ".to_string()]).await.unwrap().unwrap();
        ctx.activate(&next).await.unwrap();
        assert!(matches!(ctx.row_cells(&old_row).await, Err(BrowserError::StaleElement(_))));
        assert!(matches!(ctx.activate(&next).await, Err(BrowserError::StaleElement(_))));

        // Re-entering from the root shows the page the frame was moved to.
        ctx.switch_to_root().await.unwrap();
        ctx.enter_child_frame(0).await.unwrap();
        assert_eq!(ctx.current_url(), Some(site.url("list_2.html")));

        let page_2 = listing_cells(&ctx).await;
        assert_eq!(page_2.len(), 1);
        assert_eq!(page_2[0][2].text, "99990");
        assert!(ctx.find_control(&["次へ".to_string()]).await.unwrap().is_none());

        assert_eq!(site.hits("list_1.html"), 1);
        assert_eq!(site.hits("list_2.html"), 1);
    }

    #[tokio::test]
    async fn navigating_forgets_moved_frames() {
        let site = LocalSite::serve(&paged_listing()).await;
        let ctx = HttpBrowsingContext::new(&quick_config()).unwrap();

        ctx.navigate(&site.url("index.html")).await.unwrap();
        ctx.enter_child_frame(0).await.unwrap();
        let next = ctx.find_control(&["次へ".to_string()]).await.unwrap().unwrap();
        ctx.activate(&next).await.unwrap();

        ctx.navigate(&site.url("index.html")).await.unwrap();
        ctx.enter_child_frame(0).await.unwrap();
        assert_eq!(ctx.current_url(), Some(site.url("list_1.html")));
        assert_eq!(site.hits("list_1.html"), 2);
    }

    #[tokio::test]
    async fn missing_page_is_an_http_error_and_closed_context_refuses_work() {
        let site = LocalSite::serve(&paged_listing()).await;
        let ctx = HttpBrowsingContext::new(&quick_config()).unwrap();

        assert!(ctx.navigate(&site.url("nowhere.html")).await.is_err());
        assert!(matches!(ctx.tables().await, Err(BrowserError::NothingLoaded)));

        ctx.navigate(&site.url("index.html")).await.unwrap();
        ctx.close().await.unwrap();
        assert!(matches!(ctx.child_frame_count().await, Err(BrowserError::Closed)));
    }
}
