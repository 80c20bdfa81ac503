//! In-memory `BrowsingContext` over a synthetic frame tree.
//!
//! Each page is a root frame; activating a control replaces the page while
//! keeping the current frame path, as a click inside a results iframe does.

use super::{BrowserError, BrowsingContext, Cell, ControlHandle, RowHandle, TableHandle};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

pub const LISTING_HEADERS: [&str; 5] = ["日付", "時刻", "コード", "会社名", "表題"];

#[derive(Debug, Clone, Default)]
pub struct FixtureTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl FixtureTable {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn listing(rows: Vec<Vec<Cell>>) -> Self {
        Self { rows, ..Self::new(&LISTING_HEADERS) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixtureFrame {
    pub tables: Vec<FixtureTable>,
    pub children: Vec<FixtureFrame>,
}

impl FixtureFrame {
    pub fn with_table(mut self, table: FixtureTable) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_child(mut self, child: FixtureFrame) -> Self {
        self.children.push(child);
        self
    }
}

/// date | time | code | company | title-with-link
pub fn listing_row(date: &str, time: &str, code: &str, company: &str, title: &str, href: &str) -> Vec<Cell> {
    vec![
        Cell::text(date),
        Cell::text(time),
        Cell::text(code),
        Cell::text(company),
        Cell::link(title, href),
    ]
}

#[derive(Default)]
struct FixtureState {
    pages: Vec<FixtureFrame>,
    page: usize,
    path: Vec<usize>,
    generation: u64,
    loaded: bool,
    closed: bool,
    always_next: bool,
    hidden_until_navigation: usize,
    failing_navigations: usize,
    stale_rows: HashSet<(usize, usize)>,
    broken_tables: HashSet<Vec<usize>>,
    unreachable_frames: HashSet<Vec<usize>>,
    navigations: usize,
    activations: usize,
    visited: Vec<Vec<usize>>,
}

impl FixtureState {
    fn frame(&self) -> Result<&FixtureFrame, BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        if !self.loaded {
            return Err(BrowserError::NothingLoaded);
        }
        let mut frame = self.pages.get(self.page).ok_or(BrowserError::NothingLoaded)?;
        for &i in &self.path {
            frame = frame.children.get(i).ok_or(BrowserError::NoSuchFrame(i))?;
        }
        Ok(frame)
    }

    fn tables_visible(&self) -> bool {
        self.navigations > self.hidden_until_navigation
    }
}

pub struct FixtureContext {
    state: Mutex<FixtureState>,
}

impl FixtureContext {
    pub fn new(pages: Vec<FixtureFrame>) -> Self {
        Self {
            state: Mutex::new(FixtureState { pages, ..FixtureState::default() }),
        }
    }

    pub fn single(root: FixtureFrame) -> Self {
        Self::new(vec![root])
    }

    /// Keep offering a "next" control even on the last page.
    pub fn always_next(self) -> Self {
        self.state.lock().unwrap().always_next = true;
        self
    }

    /// Tables stay invisible until the `n`-th navigation has been exceeded.
    pub fn hide_tables_until(self, n: usize) -> Self {
        self.state.lock().unwrap().hidden_until_navigation = n;
        self
    }

    /// The first `n` navigations time out.
    pub fn fail_navigations(self, n: usize) -> Self {
        self.state.lock().unwrap().failing_navigations = n;
        self
    }

    pub fn stale_row(self, page: usize, row: usize) -> Self {
        self.state.lock().unwrap().stale_rows.insert((page, row));
        self
    }

    /// Reading tables in the frame at `path` fails with a non-transient error.
    pub fn break_tables_at(self, path: &[usize]) -> Self {
        self.state.lock().unwrap().broken_tables.insert(path.to_vec());
        self
    }

    /// Entering the frame at `path` times out.
    pub fn time_out_entering(self, path: &[usize]) -> Self {
        self.state.lock().unwrap().unreachable_frames.insert(path.to_vec());
        self
    }

    pub fn visited(&self) -> Vec<Vec<usize>> {
        self.state.lock().unwrap().visited.clone()
    }

    pub fn navigations(&self) -> usize {
        self.state.lock().unwrap().navigations
    }

    pub fn activations(&self) -> usize {
        self.state.lock().unwrap().activations
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn current_path(&self) -> Vec<usize> {
        self.state.lock().unwrap().path.clone()
    }
}

#[async_trait]
impl BrowsingContext for FixtureContext {
    async fn navigate(&self, _url: &Url) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        if s.closed {
            return Err(BrowserError::Closed);
        }
        if s.failing_navigations > 0 {
            s.failing_navigations -= 1;
            return Err(BrowserError::Timeout("fixture navigation".into()));
        }
        s.navigations += 1;
        s.loaded = true;
        s.page = 0;
        s.path.clear();
        s.generation += 1;
        Ok(())
    }

    async fn wait_until_loaded(&self, _timeout: Duration) -> Result<(), BrowserError> {
        self.state.lock().unwrap().frame().map(|_| ())
    }

    async fn switch_to_root(&self) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        s.frame()?;
        s.path.clear();
        s.generation += 1;
        Ok(())
    }

    async fn child_frame_count(&self) -> Result<usize, BrowserError> {
        Ok(self.state.lock().unwrap().frame()?.children.len())
    }

    async fn enter_child_frame(&self, index: usize) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        if index >= s.frame()?.children.len() {
            return Err(BrowserError::NoSuchFrame(index));
        }
        let mut path = s.path.clone();
        path.push(index);
        if s.unreachable_frames.contains(&path) {
            return Err(BrowserError::Timeout(format!("entering frame {path:?}")));
        }
        s.path = path.clone();
        s.visited.push(path);
        s.generation += 1;
        Ok(())
    }

    async fn leave_to_parent(&self) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        if s.path.pop().is_none() {
            return Err(BrowserError::AtRoot);
        }
        s.generation += 1;
        Ok(())
    }

    async fn tables(&self) -> Result<Vec<TableHandle>, BrowserError> {
        let s = self.state.lock().unwrap();
        let frame = s.frame()?;
        if s.broken_tables.contains(&s.path) {
            return Err(BrowserError::Unsupported(format!("tables at {:?}", s.path)));
        }
        if !s.tables_visible() {
            return Ok(Vec::new());
        }
        Ok(frame
            .tables
            .iter()
            .enumerate()
            .map(|(index, t)| TableHandle {
                generation: s.generation,
                index,
                headers: t.headers.clone(),
            })
            .collect())
    }

    async fn rows(&self, table: &TableHandle) -> Result<Vec<RowHandle>, BrowserError> {
        let s = self.state.lock().unwrap();
        if table.generation != s.generation {
            return Err(BrowserError::StaleElement("table".into()));
        }
        let t = s
            .frame()?
            .tables
            .get(table.index)
            .ok_or_else(|| BrowserError::StaleElement("table".into()))?;
        Ok((0..t.rows.len())
            .map(|index| RowHandle { generation: s.generation, table: table.index, index })
            .collect())
    }

    async fn row_cells(&self, row: &RowHandle) -> Result<Vec<Cell>, BrowserError> {
        let s = self.state.lock().unwrap();
        if row.generation != s.generation || s.stale_rows.contains(&(s.page, row.index)) {
            return Err(BrowserError::StaleElement(format!("row {}", row.index)));
        }
        s.frame()?
            .tables
            .get(row.table)
            .and_then(|t| t.rows.get(row.index))
            .cloned()
            .ok_or_else(|| BrowserError::StaleElement(format!("row {}", row.index)))
    }

    async fn find_control(&self, labels: &[String]) -> Result<Option<ControlHandle>, BrowserError> {
        let s = self.state.lock().unwrap();
        s.frame()?;
        let has_next = s.page + 1 < s.pages.len() || s.always_next;
        Ok(has_next.then(|| ControlHandle {
            generation: s.generation,
            label: labels.first().cloned().unwrap_or_default(),
            href: None,
        }))
    }

    async fn activate(&self, control: &ControlHandle) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        if control.generation != s.generation {
            return Err(BrowserError::StaleElement("control".into()));
        }
        s.activations += 1;
        s.page = (s.page + 1).min(s.pages.len().saturating_sub(1));
        s.generation += 1;
        Ok(())
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        let s = self.state.lock().unwrap();
        Ok(format!("<html data-page=\"{}\" data-path=\"{:?}\"></html>", s.page, s.path))
    }

    async fn screenshot(&self) -> Result<Option<Vec<u8>>, BrowserError> {
        Ok(Some(b"\x89PNG fixture".to_vec()))
    }

    fn current_url(&self) -> Option<Url> {
        Url::parse("https://fixture.test/index.html").ok()
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
