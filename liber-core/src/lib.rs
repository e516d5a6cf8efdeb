use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Error, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Number of consecutive pages shown at once in scroll mode.
pub const SCROLL_WINDOW: usize = 3;

/// Transparent rows inserted between stacked pages in scroll mode.
pub const PAGE_GAP: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Cbz,
    Epub,
}

impl DocumentFormat {
    /// Picks the handler for a file by its extension. Anything else is not ours.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "cbz" => Some(Self::Cbz),
            "epub" => Some(Self::Epub),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cbz => "cbz",
            Self::Epub => "epub",
        }
    }
}

/// Progress is keyed by the bare file name, so the same book opened from a
/// different directory resumes where it was left.
pub fn document_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingMode {
    #[default]
    Page,
    Scroll,
}

impl ReadingMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Page => Self::Scroll,
            Self::Scroll => Self::Page,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Scroll => "scroll",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }

    pub fn is_dark(&self) -> bool {
        matches!(self, Self::Dark)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub reading_mode: ReadingMode,
    pub reverse_direction: bool,
    /// Percentage applied to e-book text; 100 wraps at the full terminal
    /// width and larger sizes wrap narrower.
    pub font_size: u16,
    pub theme: Theme,
}

impl Preferences {
    pub const MIN_FONT_SIZE: u16 = 100;
    pub const MAX_FONT_SIZE: u16 = 300;
    pub const FONT_SIZE_STEP: i16 = 10;
    const MIN_TEXT_WIDTH: usize = 20;

    pub fn adjust_font_size(&mut self, delta: i16) -> bool {
        let next = (i32::from(self.font_size) + i32::from(delta)).clamp(
            i32::from(Self::MIN_FONT_SIZE),
            i32::from(Self::MAX_FONT_SIZE),
        ) as u16;
        if next != self.font_size {
            self.font_size = next;
            true
        } else {
            false
        }
    }

    pub fn text_width(&self, columns: u16) -> usize {
        let columns = usize::from(columns).max(Self::MIN_TEXT_WIDTH);
        let font_size = usize::from(self.font_size.max(1));
        (columns * 100 / font_size).clamp(Self::MIN_TEXT_WIDTH, columns)
    }
}

/// Per-run settings that take precedence over the stored preferences and
/// are never saved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreferenceOverrides {
    pub reading_mode: Option<ReadingMode>,
    pub reverse_direction: Option<bool>,
    pub theme: Option<Theme>,
}

impl PreferenceOverrides {
    pub fn apply(&self, mut preferences: Preferences) -> Preferences {
        if let Some(mode) = self.reading_mode {
            preferences.reading_mode = mode;
        }
        if let Some(reverse) = self.reverse_direction {
            preferences.reverse_direction = reverse;
        }
        if let Some(theme) = self.theme {
            preferences.theme = theme;
        }
        preferences
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            reading_mode: ReadingMode::Page,
            reverse_direction: false,
            font_size: 100,
            theme: Theme::Light,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub path: PathBuf,
    pub name: String,
    pub format: DocumentFormat,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

impl DocumentInfo {
    pub fn new(
        path: &Path,
        format: DocumentFormat,
        page_count: usize,
        metadata: DocumentMetadata,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            name: document_key(path),
            format,
            page_count,
            metadata,
        }
    }

    pub fn display_title(&self) -> &str {
        self.metadata.title.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub dark_mode: bool,
    /// Wrap width for reflowable text, ignored by image pages.
    pub text_width: usize,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            dark_mode: false,
            text_width: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderImage {
    /// Stacks RGBA images top to bottom, centred horizontally on a
    /// transparent canvas with `PAGE_GAP` rows between them.
    pub fn stack_vertical(images: &[RenderImage]) -> RenderImage {
        let width = images.iter().map(|image| image.width).max().unwrap_or(0);
        let content_height: u32 = images.iter().map(|image| image.height).sum();
        let gaps = PAGE_GAP * (images.len().saturating_sub(1) as u32);
        let height = content_height + gaps;
        let stride = width as usize * 4;
        let mut pixels = vec![0u8; stride * height as usize];

        let mut row = 0usize;
        for image in images {
            let image_stride = image.width as usize * 4;
            let left = ((width - image.width) / 2) as usize * 4;
            for src_row in 0..image.height as usize {
                let src = &image.pixels[src_row * image_stride..(src_row + 1) * image_stride];
                let start = (row + src_row) * stride + left;
                pixels[start..start + image_stride].copy_from_slice(src);
            }
            row += image.height as usize + PAGE_GAP as usize;
        }

        RenderImage {
            width,
            height,
            pixels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageContent {
    Image(RenderImage),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageView {
    Single(PageContent),
    Strip(Vec<PageContent>),
}

impl PageView {
    /// Collapses a scroll strip into one drawable page.
    pub fn into_content(self) -> PageContent {
        match self {
            PageView::Single(content) => content,
            PageView::Strip(pages) => {
                let mut images = Vec::new();
                let mut texts = Vec::new();
                for page in pages {
                    match page {
                        PageContent::Image(image) => images.push(image),
                        PageContent::Text(text) => texts.push(text),
                    }
                }
                if texts.is_empty() {
                    PageContent::Image(RenderImage::stack_vertical(&images))
                } else {
                    PageContent::Text(texts.join("\n\n"))
                }
            }
        }
    }
}

/// Navigation state of the open document. `index` is 0-based and always
/// stays inside `[0, total - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderState {
    pub index: usize,
    pub total: usize,
    pub mode: ReadingMode,
    pub reverse: bool,
}

impl ReaderState {
    pub fn new(total: usize, preferences: &Preferences) -> Self {
        Self {
            index: 0,
            total,
            mode: preferences.reading_mode,
            reverse: preferences.reverse_direction,
        }
    }

    pub fn restore(&mut self, page: usize) {
        self.index = page.min(self.last_index());
    }

    /// Moves toward the end of the book, or toward the start when reading
    /// right to left. Only meaningful in page mode.
    pub fn next(&mut self, count: usize) -> bool {
        if self.mode != ReadingMode::Page {
            return false;
        }
        if self.reverse {
            self.step_back(count)
        } else {
            self.step_forward(count)
        }
    }

    pub fn prev(&mut self, count: usize) -> bool {
        if self.mode != ReadingMode::Page {
            return false;
        }
        if self.reverse {
            self.step_forward(count)
        } else {
            self.step_back(count)
        }
    }

    /// Jumps to a 1-based page number. Out of range requests leave the
    /// state untouched.
    pub fn goto(&mut self, page: usize) -> bool {
        if page == 0 || page > self.total {
            return false;
        }
        self.index = page - 1;
        true
    }

    pub fn goto_last(&mut self) -> bool {
        if self.total == 0 {
            return false;
        }
        self.move_to(self.last_index())
    }

    pub fn scroll_by(&mut self, delta: isize) -> bool {
        if self.mode != ReadingMode::Scroll {
            return false;
        }
        let next = if delta.is_negative() {
            self.index.saturating_sub(delta.unsigned_abs())
        } else {
            self.index
                .saturating_add(delta as usize)
                .min(self.last_index())
        };
        self.move_to(next)
    }

    pub fn visible_pages(&self) -> std::ops::Range<usize> {
        match self.mode {
            ReadingMode::Page => self.index..(self.index + 1).min(self.total),
            ReadingMode::Scroll => self.index..(self.index + SCROLL_WINDOW).min(self.total),
        }
    }

    fn step_forward(&mut self, count: usize) -> bool {
        let next = self
            .index
            .saturating_add(count.max(1))
            .min(self.last_index());
        self.move_to(next)
    }

    fn step_back(&mut self, count: usize) -> bool {
        let next = self.index.saturating_sub(count.max(1));
        self.move_to(next)
    }

    fn move_to(&mut self, next: usize) -> bool {
        if next != self.index {
            self.index = next;
            true
        } else {
            false
        }
    }

    fn last_index(&self) -> usize {
        self.total.saturating_sub(1)
    }
}

pub struct DocumentInstance {
    pub info: DocumentInfo,
    pub backend: Arc<dyn DocumentBackend>,
    pub state: ReaderState,
    render_cache: Mutex<HashMap<CacheKey, PageContent>>,
    recorded_page: Mutex<Option<usize>>,
}

impl DocumentInstance {
    pub fn new(info: DocumentInfo, backend: Arc<dyn DocumentBackend>, state: ReaderState) -> Self {
        Self {
            info,
            backend,
            state,
            render_cache: Mutex::new(HashMap::new()),
            recorded_page: Mutex::new(None),
        }
    }

    pub fn render_view(&self, dark_mode: bool, text_width: usize) -> Result<PageView> {
        let reference = self.state.index;
        match self.state.mode {
            ReadingMode::Page => {
                let page = self.render_page_internal(reference, dark_mode, text_width, reference)?;
                Ok(PageView::Single(page))
            }
            ReadingMode::Scroll => {
                let pages = self
                    .state
                    .visible_pages()
                    .map(|index| self.render_page_internal(index, dark_mode, text_width, reference))
                    .collect::<Result<Vec<_>>>()?;
                Ok(PageView::Strip(pages))
            }
        }
    }

    pub fn prefetch_neighbors(&self, range: usize, dark_mode: bool, text_width: usize) -> Result<()> {
        if range == 0 {
            return Ok(());
        }

        let visible = self.state.visible_pages();
        let current_page = self.state.index;
        let page_count = self.info.page_count;
        let pages: Vec<usize> = (1..=range)
            .flat_map(|offset| {
                [
                    visible.start.checked_sub(offset),
                    Some(visible.end.saturating_sub(1) + offset),
                ]
            })
            .flatten()
            .filter(|page| *page < page_count)
            .collect();

        let errors: Vec<Error> = pages
            .par_iter()
            .filter_map(|&page| {
                self.render_page_internal(page, dark_mode, text_width, current_page)
                    .err()
            })
            .collect();

        match errors.into_iter().last() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns true when the stored progress was actually rewritten.
    fn record_progress(&self, store: &dyn ProgressStore) -> Result<bool> {
        let page = self.state.index;
        let mut recorded = self.recorded_page.lock();
        if *recorded == Some(page) {
            return Ok(false);
        }
        let record = ProgressRecord {
            format: self.info.format,
            page,
        };
        store.set(&self.info.name, &record)?;
        *recorded = Some(page);
        Ok(true)
    }

    fn render_page_internal(
        &self,
        page_index: usize,
        dark_mode: bool,
        text_width: usize,
        reference_page: usize,
    ) -> Result<PageContent> {
        if page_index >= self.info.page_count {
            anyhow::bail!("page {} out of range", page_index);
        }

        let key = CacheKey::new(page_index, dark_mode, text_width);
        if let Some(page) = self.try_get_cached(&key) {
            return Ok(page);
        }

        let request = RenderRequest {
            page_index,
            dark_mode,
            text_width,
        };
        let page = self.backend.render_page(request)?;
        self.store_cached_render(key, &page, reference_page);
        Ok(page)
    }

    fn try_get_cached(&self, key: &CacheKey) -> Option<PageContent> {
        self.render_cache.lock().get(key).cloned()
    }

    fn store_cached_render(&self, key: CacheKey, page: &PageContent, reference_page: usize) {
        let mut cache = self.render_cache.lock();
        cache.insert(key, page.clone());

        if cache.len() > CACHE_CAPACITY {
            let mut keys: Vec<_> = cache.keys().cloned().collect();
            keys.sort_by_key(|k| k.distance(reference_page));
            for stale in keys.into_iter().skip(CACHE_CAPACITY) {
                cache.remove(&stale);
            }
        }
    }
}

const CACHE_CAPACITY: usize = 12;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct CacheKey {
    page_index: usize,
    dark_mode: bool,
    text_width: usize,
}

impl CacheKey {
    fn new(page_index: usize, dark_mode: bool, text_width: usize) -> Self {
        Self {
            page_index,
            dark_mode,
            text_width,
        }
    }

    fn distance(&self, reference_page: usize) -> usize {
        self.page_index.abs_diff(reference_page)
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    /// 1-based page number.
    GotoPage { page: usize },
    GotoLastPage,
    ScrollBy { delta: isize },
    SetReadingMode { mode: ReadingMode },
    ToggleReadingMode,
    ToggleDirection,
    AdjustFontSize { delta: i16 },
    ToggleTheme,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DocumentOpened(String),
    DocumentClosed(String),
    StaleLoadDiscarded(String),
    PreferencesChanged,
    RedrawNeeded,
}

/// Generation number handed out when a load starts. Only the newest ticket
/// may commit its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoadTicket(u64);

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> Result<PageContent>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    fn supports(&self, format: DocumentFormat) -> bool;
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "type")]
    pub format: DocumentFormat,
    pub page: usize,
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to access progress file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("progress file {path:?} is not valid JSON")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait ProgressStore: Send + Sync {
    /// Only a record written for the same format counts.
    fn get(&self, name: &str, format: DocumentFormat) -> Result<Option<ProgressRecord>>;
    fn set(&self, name: &str, record: &ProgressRecord) -> Result<()>;
}

type ProgressMap = BTreeMap<String, serde_json::Value>;

/// All records live in one JSON object keyed by file name.
pub struct FileProgressStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileProgressStore {
    pub const FILE_NAME: &'static str = "progress.json";

    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self {
            path: root.join(Self::FILE_NAME),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<ProgressMap, ProgressError> {
        if !self.path.exists() {
            return Ok(ProgressMap::new());
        }
        let io_err = |source| ProgressError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = File::open(&self.path).map_err(io_err)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(io_err)?;
        if buf.trim().is_empty() {
            return Ok(ProgressMap::new());
        }
        serde_json::from_str(&buf).map_err(|source| ProgressError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_map(&self, map: &ProgressMap) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(map)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp progress file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace progress file {:?}", self.path))?;
        Ok(())
    }
}

impl ProgressStore for FileProgressStore {
    fn get(&self, name: &str, format: DocumentFormat) -> Result<Option<ProgressRecord>> {
        let _guard = self.lock.lock();
        let map = match self.read_map() {
            Ok(map) => map,
            Err(err @ ProgressError::Corrupt { .. }) => {
                warn!(error = %err, "ignoring unreadable reading progress");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let Some(value) = map.get(name) else {
            return Ok(None);
        };
        match serde_json::from_value::<ProgressRecord>(value.clone()) {
            Ok(record) if record.format == format => Ok(Some(record)),
            Ok(record) => {
                debug!(name, stored = record.format.as_str(), "progress belongs to another format");
                Ok(None)
            }
            Err(err) => {
                warn!(name, %err, "ignoring malformed progress record");
                Ok(None)
            }
        }
    }

    fn set(&self, name: &str, record: &ProgressRecord) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = match self.read_map() {
            Ok(map) => map,
            Err(err @ ProgressError::Corrupt { .. }) => {
                warn!(error = %err, "replacing unreadable reading progress");
                ProgressMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        map.insert(name.to_string(), serde_json::to_value(record)?);
        self.write_map(&map)
    }
}

pub struct MemoryProgressStore {
    inner: Mutex<HashMap<String, ProgressRecord>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, name: &str, format: DocumentFormat) -> Result<Option<ProgressRecord>> {
        Ok(self
            .inner
            .lock()
            .get(name)
            .copied()
            .filter(|record| record.format == format))
    }

    fn set(&self, name: &str, record: &ProgressRecord) -> Result<()> {
        self.inner.lock().insert(name.to_string(), *record);
        Ok(())
    }
}

pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> Result<Option<Preferences>>;
    fn save(&self, preferences: &Preferences) -> Result<()>;
}

pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    pub const FILE_NAME: &'static str = "preferences.toml";

    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self {
            path: root.join(Self::FILE_NAME),
        })
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load(&self) -> Result<Option<Preferences>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read preferences {:?}", self.path))?;
        let preferences = toml::from_str(&raw)
            .with_context(|| format!("failed to decode preferences {:?}", self.path))?;
        Ok(Some(preferences))
    }

    fn save(&self, preferences: &Preferences) -> Result<()> {
        let tmp = self.path.with_extension("toml.tmp");
        let payload = toml::to_string_pretty(preferences)?;
        fs::write(&tmp, payload)
            .with_context(|| format!("failed to write temp preferences {:?}", tmp))?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPreferenceStore {
    inner: Mutex<Option<Preferences>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<Option<Preferences>> {
        Ok(*self.inner.lock())
    }

    fn save(&self, preferences: &Preferences) -> Result<()> {
        *self.inner.lock() = Some(*preferences);
        Ok(())
    }
}

/// Owns the open document and every piece of reader state. UI code only
/// talks to it through `Command`s and the load API.
pub struct Session {
    document: Option<DocumentInstance>,
    /// Effective settings: the stored ones with the overrides applied.
    preferences: Preferences,
    stored_preferences: Preferences,
    overrides: PreferenceOverrides,
    progress: Arc<dyn ProgressStore>,
    preference_store: Arc<dyn PreferenceStore>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
    generation: u64,
}

impl Session {
    pub fn new(progress: Arc<dyn ProgressStore>, preference_store: Arc<dyn PreferenceStore>) -> Self {
        Self::with_overrides(progress, preference_store, PreferenceOverrides::default())
    }

    /// Loads the stored preferences and layers `overrides` on top for this
    /// session only.
    pub fn with_overrides(
        progress: Arc<dyn ProgressStore>,
        preference_store: Arc<dyn PreferenceStore>,
        overrides: PreferenceOverrides,
    ) -> Self {
        let stored = match preference_store.load() {
            Ok(stored) => stored.unwrap_or_default(),
            Err(err) => {
                warn!(?err, "falling back to default preferences");
                Preferences::default()
            }
        };
        let mut session = Self::with_preferences(progress, preference_store, stored);
        session.overrides = overrides;
        session.preferences = overrides.apply(stored);
        session
    }

    pub fn with_preferences(
        progress: Arc<dyn ProgressStore>,
        preference_store: Arc<dyn PreferenceStore>,
        preferences: Preferences,
    ) -> Self {
        Self {
            document: None,
            preferences,
            stored_preferences: preferences,
            overrides: PreferenceOverrides::default(),
            progress,
            preference_store,
            events: Arc::new(Mutex::new(Vec::new())),
            generation: 0,
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn active(&self) -> Option<&DocumentInstance> {
        self.document.as_ref()
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    /// What gets saved: the effective preferences minus unchanged overrides.
    pub fn stored_preferences(&self) -> &Preferences {
        &self.stored_preferences
    }

    /// Opens `path` and makes it the active document. Returns `false` when
    /// the file has no handler or a newer load superseded this one.
    #[instrument(skip(self, provider))]
    pub async fn open_with<P: DocumentProvider>(
        &mut self,
        provider: &P,
        path: PathBuf,
    ) -> Result<bool> {
        let supported = DocumentFormat::from_path(&path).filter(|format| provider.supports(*format));
        if supported.is_none() {
            debug!(?path, "no handler for file, ignoring");
            return Ok(false);
        }

        let ticket = self.begin_load(&path);
        let backend = provider
            .open(&path)
            .await
            .with_context(|| format!("failed to open {:?}", path))?;
        self.finish_load(ticket, backend)
    }

    /// Clears the current document and issues the ticket that the matching
    /// `finish_load` must present.
    pub fn begin_load(&mut self, path: &Path) -> LoadTicket {
        self.generation += 1;
        if let Some(doc) = self.document.take() {
            self.events
                .lock()
                .push(SessionEvent::DocumentClosed(doc.info.name));
        }
        debug!(?path, generation = self.generation, "load started");
        LoadTicket(self.generation)
    }

    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        backend: Arc<dyn DocumentBackend>,
    ) -> Result<bool> {
        let info = backend.info().clone();
        if ticket.0 != self.generation {
            info!(
                name = %info.name,
                ticket = ticket.0,
                current = self.generation,
                "discarding stale load"
            );
            self.events
                .lock()
                .push(SessionEvent::StaleLoadDiscarded(info.name));
            return Ok(false);
        }

        let mut state = ReaderState::new(info.page_count, &self.preferences);
        match self.progress.get(&info.name, info.format) {
            Ok(Some(record)) => state.restore(record.page),
            Ok(None) => {}
            Err(err) => warn!(?err, name = %info.name, "could not load reading progress"),
        }

        info!(
            name = %info.name,
            format = info.format.as_str(),
            pages = info.page_count,
            start = state.index,
            "document opened"
        );
        self.events
            .lock()
            .push(SessionEvent::DocumentOpened(info.name.clone()));
        self.document = Some(DocumentInstance::new(info, backend, state));
        Ok(true)
    }

    /// Renders what the reader should currently see and, once that
    /// succeeded, records the position. `None` when there is nothing to show.
    pub fn render_active(&self, columns: u16) -> Result<Option<PageView>> {
        let Some(doc) = self.document.as_ref().filter(|doc| doc.info.page_count > 0) else {
            return Ok(None);
        };
        let view = doc.render_view(self.preferences.theme.is_dark(), self.text_width(columns))?;
        if let Err(err) = doc.record_progress(self.progress.as_ref()) {
            warn!(?err, name = %doc.info.name, "could not save reading progress");
        }
        Ok(Some(view))
    }

    pub fn prefetch(&self, range: usize, columns: u16) -> Result<()> {
        match self.document.as_ref() {
            Some(doc) => doc.prefetch_neighbors(
                range,
                self.preferences.theme.is_dark(),
                self.text_width(columns),
            ),
            None => Ok(()),
        }
    }

    pub fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::NextPage { count } => {
                self.navigate(|state| state.next(count));
            }
            Command::PrevPage { count } => {
                self.navigate(|state| state.prev(count));
            }
            Command::GotoPage { page } => {
                let accepted = self.navigate(|state| state.goto(page));
                if !accepted && self.document.is_some() {
                    debug!(page, "rejected out of range page");
                }
            }
            Command::GotoLastPage => {
                self.navigate(ReaderState::goto_last);
            }
            Command::ScrollBy { delta } => {
                self.navigate(|state| state.scroll_by(delta));
            }
            Command::SetReadingMode { mode } => {
                if self.preferences.reading_mode != mode {
                    self.update_preferences(|stored, overrides| {
                        stored.reading_mode = mode;
                        overrides.reading_mode = None;
                    });
                }
            }
            Command::ToggleReadingMode => {
                let mode = self.preferences.reading_mode.toggled();
                self.update_preferences(|stored, overrides| {
                    stored.reading_mode = mode;
                    overrides.reading_mode = None;
                });
            }
            Command::ToggleDirection => {
                let reverse = !self.preferences.reverse_direction;
                self.update_preferences(|stored, overrides| {
                    stored.reverse_direction = reverse;
                    overrides.reverse_direction = None;
                });
            }
            Command::AdjustFontSize { delta } => {
                if self.stored_preferences.adjust_font_size(delta) {
                    self.preferences_changed();
                }
            }
            Command::ToggleTheme => {
                let theme = self.preferences.theme.toggled();
                self.update_preferences(|stored, overrides| {
                    stored.theme = theme;
                    overrides.theme = None;
                });
            }
        }
        Ok(())
    }

    fn navigate(&mut self, step: impl FnOnce(&mut ReaderState) -> bool) -> bool {
        let Some(doc) = self.document.as_mut() else {
            return false;
        };
        let moved = step(&mut doc.state);
        if moved {
            self.events.lock().push(SessionEvent::RedrawNeeded);
        }
        moved
    }

    /// A setting changed from inside the reader replaces any per-run
    /// override for it and is saved.
    fn update_preferences(&mut self, change: impl FnOnce(&mut Preferences, &mut PreferenceOverrides)) {
        change(&mut self.stored_preferences, &mut self.overrides);
        self.preferences_changed();
    }

    fn preferences_changed(&mut self) {
        self.preferences = self.overrides.apply(self.stored_preferences);
        if let Some(doc) = self.document.as_mut() {
            doc.state.mode = self.preferences.reading_mode;
            doc.state.reverse = self.preferences.reverse_direction;
        }
        if let Err(err) = self.preference_store.save(&self.stored_preferences) {
            warn!(?err, "could not save preferences");
        }
        let mut events = self.events.lock();
        events.push(SessionEvent::PreferencesChanged);
        events.push(SessionEvent::RedrawNeeded);
    }

    fn text_width(&self, columns: u16) -> usize {
        self.preferences.text_width(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempfile::tempdir;

    struct FakeBackend {
        info: DocumentInfo,
        renders: AtomicUsize,
        fail_page: Option<usize>,
    }

    impl DocumentBackend for FakeBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn render_page(&self, request: RenderRequest) -> Result<PageContent> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            if self.fail_page == Some(request.page_index) {
                anyhow::bail!("corrupt page {}", request.page_index);
            }
            Ok(PageContent::Image(RenderImage {
                width: 1,
                height: 1,
                pixels: vec![request.page_index as u8, 0, 0, 255],
            }))
        }
    }

    fn fake_backend(path: &str, pages: usize) -> Arc<FakeBackend> {
        let path = Path::new(path);
        let format = DocumentFormat::from_path(path).unwrap_or(DocumentFormat::Cbz);
        Arc::new(FakeBackend {
            info: DocumentInfo::new(path, format, pages, DocumentMetadata::default()),
            renders: AtomicUsize::new(0),
            fail_page: None,
        })
    }

    struct FakeProvider {
        pages: usize,
        formats: Vec<DocumentFormat>,
    }

    impl FakeProvider {
        fn comics(pages: usize) -> Self {
            Self {
                pages,
                formats: vec![DocumentFormat::Cbz],
            }
        }
    }

    #[async_trait::async_trait]
    impl DocumentProvider for FakeProvider {
        fn supports(&self, format: DocumentFormat) -> bool {
            self.formats.contains(&format)
        }

        async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
            let backend: Arc<dyn DocumentBackend> =
                fake_backend(&path.to_string_lossy(), self.pages);
            Ok(backend)
        }
    }

    fn memory_session() -> (Session, Arc<MemoryProgressStore>) {
        let progress = Arc::new(MemoryProgressStore::new());
        let session = Session::new(progress.clone(), Arc::new(MemoryPreferenceStore::new()));
        (session, progress)
    }

    fn index(session: &Session) -> usize {
        session.active().unwrap().state.index
    }

    fn page_state(total: usize) -> ReaderState {
        ReaderState::new(total, &Preferences::default())
    }

    #[test]
    fn goto_accepts_every_valid_page_number() {
        let mut state = page_state(7);
        for page in 1..=7 {
            assert!(state.goto(page));
            assert_eq!(state.index, page - 1);
        }
    }

    #[test]
    fn goto_rejects_zero_and_past_the_end() {
        let mut state = page_state(5);
        state.goto(3);
        assert!(!state.goto(0));
        assert_eq!(state.index, 2);
        assert!(!state.goto(6));
        assert_eq!(state.index, 2);
    }

    #[test]
    fn reverse_direction_swaps_neighbours() {
        let mut state = page_state(5);
        state.goto(3);
        assert!(state.next(1));
        assert_eq!(state.index, 3);

        state.goto(3);
        state.reverse = true;
        assert!(state.next(1));
        assert_eq!(state.index, 1);
        assert!(state.prev(1));
        assert_eq!(state.index, 2);
    }

    #[test]
    fn navigation_stops_at_the_edges() {
        let mut state = page_state(3);
        assert!(!state.prev(1));
        assert_eq!(state.index, 0);
        assert!(state.next(10));
        assert_eq!(state.index, 2);
        assert!(!state.next(1));
        assert_eq!(state.index, 2);
    }

    #[test]
    fn page_turns_are_ignored_in_scroll_mode() {
        let mut state = page_state(5);
        state.mode = ReadingMode::Scroll;
        assert!(!state.next(1));
        assert!(!state.prev(1));
        assert_eq!(state.index, 0);
        assert!(state.scroll_by(2));
        assert_eq!(state.index, 2);
        assert!(state.scroll_by(-5));
        assert_eq!(state.index, 0);
        assert_eq!(state.visible_pages(), 0..3);
    }

    #[test]
    fn restore_clamps_to_last_page() {
        let mut state = page_state(4);
        state.restore(40);
        assert_eq!(state.index, 3);
    }

    #[test]
    fn font_size_is_clamped() {
        let mut prefs = Preferences::default();
        assert!(prefs.adjust_font_size(Preferences::FONT_SIZE_STEP));
        assert_eq!(prefs.font_size, 110);
        assert!(prefs.adjust_font_size(1000));
        assert_eq!(prefs.font_size, Preferences::MAX_FONT_SIZE);
        assert!(!prefs.adjust_font_size(10));
        assert!(prefs.adjust_font_size(-1000));
        assert_eq!(prefs.font_size, Preferences::MIN_FONT_SIZE);
        assert_eq!(prefs.text_width(80), 80);
    }

    #[test]
    fn format_is_detected_from_extension() {
        assert_eq!(
            DocumentFormat::from_path(Path::new("/comics/Vol 1.CBZ")),
            Some(DocumentFormat::Cbz)
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("book.epub")),
            Some(DocumentFormat::Epub)
        );
        assert_eq!(DocumentFormat::from_path(Path::new("notes.pdf")), None);
        assert_eq!(DocumentFormat::from_path(Path::new("cbz")), None);
    }

    #[tokio::test]
    async fn three_page_walkthrough() {
        let (mut session, _) = memory_session();
        let provider = FakeProvider::comics(3);
        assert!(session
            .open_with(&provider, PathBuf::from("/tmp/three.cbz"))
            .await
            .unwrap());

        session.apply(Command::GotoPage { page: 2 }).unwrap();
        session.apply(Command::NextPage { count: 1 }).unwrap();
        assert_eq!(index(&session), 2);
        session.apply(Command::PrevPage { count: 1 }).unwrap();
        session.apply(Command::PrevPage { count: 1 }).unwrap();
        assert_eq!(index(&session), 0);
    }

    #[tokio::test]
    async fn toggling_direction_reverses_next() {
        let (mut session, _) = memory_session();
        session
            .open_with(&FakeProvider::comics(5), PathBuf::from("rtl.cbz"))
            .await
            .unwrap();
        session.apply(Command::GotoPage { page: 3 }).unwrap();
        session.apply(Command::NextPage { count: 1 }).unwrap();
        assert_eq!(index(&session), 3);

        session.apply(Command::ToggleDirection).unwrap();
        session.apply(Command::NextPage { count: 1 }).unwrap();
        assert_eq!(index(&session), 2);
        assert!(session.preferences().reverse_direction);
    }

    #[tokio::test]
    async fn navigation_without_document_is_a_no_op() {
        let (mut session, _) = memory_session();
        session.apply(Command::NextPage { count: 1 }).unwrap();
        session.apply(Command::GotoPage { page: 1 }).unwrap();
        assert!(session.active().is_none());
        assert!(session.render_active(80).unwrap().is_none());
    }

    #[tokio::test]
    async fn reopening_restores_saved_page() {
        let (mut session, progress) = memory_session();
        let provider = FakeProvider::comics(10);
        session
            .open_with(&provider, PathBuf::from("/a/saga.cbz"))
            .await
            .unwrap();
        session.apply(Command::GotoPage { page: 7 }).unwrap();
        session.render_active(80).unwrap();

        assert_eq!(
            progress.get("saga.cbz", DocumentFormat::Cbz).unwrap(),
            Some(ProgressRecord {
                format: DocumentFormat::Cbz,
                page: 6
            })
        );

        session
            .open_with(&provider, PathBuf::from("/b/saga.cbz"))
            .await
            .unwrap();
        assert_eq!(index(&session), 6);
    }

    #[tokio::test]
    async fn progress_waits_for_a_successful_render() {
        let (mut session, progress) = memory_session();
        let backend = Arc::new(FakeBackend {
            info: DocumentInfo::new(
                Path::new("broken.cbz"),
                DocumentFormat::Cbz,
                3,
                DocumentMetadata::default(),
            ),
            renders: AtomicUsize::new(0),
            fail_page: Some(1),
        });
        let ticket = session.begin_load(Path::new("broken.cbz"));
        session.finish_load(ticket, backend).unwrap();

        session.apply(Command::NextPage { count: 1 }).unwrap();
        assert!(progress.get("broken.cbz", DocumentFormat::Cbz).unwrap().is_none());
        assert!(session.render_active(80).is_err());
        assert!(progress.get("broken.cbz", DocumentFormat::Cbz).unwrap().is_none());

        session.apply(Command::NextPage { count: 1 }).unwrap();
        session.render_active(80).unwrap();
        assert_eq!(
            progress
                .get("broken.cbz", DocumentFormat::Cbz)
                .unwrap()
                .map(|record| record.page),
            Some(2)
        );
    }

    #[tokio::test]
    async fn opening_a_new_file_resets_position() {
        let (mut session, _) = memory_session();
        let provider = FakeProvider::comics(8);
        session
            .open_with(&provider, PathBuf::from("first.cbz"))
            .await
            .unwrap();
        session.apply(Command::GotoPage { page: 5 }).unwrap();

        session
            .open_with(&FakeProvider::comics(2), PathBuf::from("second.cbz"))
            .await
            .unwrap();
        let doc = session.active().unwrap();
        assert_eq!(doc.state.index, 0);
        assert_eq!(doc.state.total, 2);
        assert_eq!(doc.info.name, "second.cbz");

        let events = session.events();
        let events = events.lock();
        assert!(events.contains(&SessionEvent::DocumentClosed("first.cbz".into())));
    }

    #[tokio::test]
    async fn unsupported_files_leave_the_session_alone() {
        let (mut session, _) = memory_session();
        let provider = FakeProvider::comics(4);
        session
            .open_with(&provider, PathBuf::from("keep.cbz"))
            .await
            .unwrap();
        session.apply(Command::GotoPage { page: 3 }).unwrap();

        assert!(!session
            .open_with(&provider, PathBuf::from("notes.txt"))
            .await
            .unwrap());
        assert!(!session
            .open_with(&provider, PathBuf::from("novel.epub"))
            .await
            .unwrap());
        assert_eq!(session.active().unwrap().info.name, "keep.cbz");
        assert_eq!(index(&session), 2);
    }

    #[test]
    fn stale_load_is_discarded() {
        let (mut session, _) = memory_session();
        let first = session.begin_load(Path::new("slow.cbz"));
        let second = session.begin_load(Path::new("fast.cbz"));
        assert!(first < second);

        assert!(session
            .finish_load(second, fake_backend("fast.cbz", 4))
            .unwrap());
        assert!(!session
            .finish_load(first, fake_backend("slow.cbz", 9))
            .unwrap());
        assert_eq!(session.active().unwrap().info.name, "fast.cbz");

        let events = session.events();
        assert!(events
            .lock()
            .contains(&SessionEvent::StaleLoadDiscarded("slow.cbz".into())));
    }

    #[tokio::test]
    async fn settings_toggle_requests_redraw_and_persist() {
        let progress = Arc::new(MemoryProgressStore::new());
        let prefs = Arc::new(MemoryPreferenceStore::new());
        let mut session = Session::new(progress.clone(), prefs.clone());
        session
            .open_with(&FakeProvider::comics(6), PathBuf::from("mode.cbz"))
            .await
            .unwrap();
        session.events().lock().clear();

        session.apply(Command::ToggleReadingMode).unwrap();
        session.apply(Command::ToggleTheme).unwrap();
        assert_eq!(session.active().unwrap().state.mode, ReadingMode::Scroll);

        let stored = prefs.load().unwrap().unwrap();
        assert_eq!(stored.reading_mode, ReadingMode::Scroll);
        assert_eq!(stored.theme, Theme::Dark);
        assert!(session.events().lock().contains(&SessionEvent::RedrawNeeded));

        let restarted = Session::new(progress, prefs);
        assert_eq!(restarted.preferences().reading_mode, ReadingMode::Scroll);
    }

    #[tokio::test]
    async fn run_overrides_are_not_saved_with_other_settings() {
        let progress = Arc::new(MemoryProgressStore::new());
        let prefs = Arc::new(MemoryPreferenceStore::new());
        let overrides = PreferenceOverrides {
            reverse_direction: Some(true),
            theme: Some(Theme::Dark),
            ..PreferenceOverrides::default()
        };
        let mut session = Session::with_overrides(progress.clone(), prefs.clone(), overrides);
        assert!(session.preferences().reverse_direction);
        assert_eq!(session.preferences().theme, Theme::Dark);

        session
            .apply(Command::AdjustFontSize {
                delta: Preferences::FONT_SIZE_STEP,
            })
            .unwrap();
        assert_eq!(session.preferences().font_size, 110);
        assert_eq!(session.preferences().theme, Theme::Dark);

        let stored = prefs.load().unwrap().unwrap();
        assert_eq!(stored.font_size, 110);
        assert_eq!(stored.theme, Theme::Light);
        assert!(!stored.reverse_direction);

        let restarted = Session::new(progress, prefs);
        assert_eq!(restarted.preferences().theme, Theme::Light);
        assert_eq!(restarted.preferences().font_size, 110);
    }

    #[test]
    fn changing_an_overridden_setting_saves_the_new_value() {
        let prefs = Arc::new(MemoryPreferenceStore::new());
        let overrides = PreferenceOverrides {
            theme: Some(Theme::Dark),
            ..PreferenceOverrides::default()
        };
        let mut session =
            Session::with_overrides(Arc::new(MemoryProgressStore::new()), prefs.clone(), overrides);

        session.apply(Command::ToggleTheme).unwrap();
        assert_eq!(session.preferences().theme, Theme::Light);
        session.apply(Command::ToggleTheme).unwrap();
        assert_eq!(session.preferences().theme, Theme::Dark);
        assert_eq!(session.stored_preferences().theme, Theme::Dark);
        assert_eq!(prefs.load().unwrap().unwrap().theme, Theme::Dark);
    }

    #[test]
    fn text_never_wraps_wider_than_the_terminal() {
        let mut prefs = Preferences {
            font_size: 10,
            ..Preferences::default()
        };
        for columns in [20u16, 80, 200] {
            assert!(prefs.text_width(columns) <= usize::from(columns));
        }
        prefs.font_size = 200;
        assert_eq!(prefs.text_width(80), 40);
        prefs.font_size = 300;
        assert_eq!(prefs.text_width(30), 20);
    }

    #[tokio::test]
    async fn scroll_mode_renders_a_strip_from_the_restored_page() {
        let (mut session, progress) = memory_session();
        progress
            .set(
                "long.cbz",
                &ProgressRecord {
                    format: DocumentFormat::Cbz,
                    page: 4,
                },
            )
            .unwrap();
        session
            .apply(Command::SetReadingMode {
                mode: ReadingMode::Scroll,
            })
            .unwrap();
        session
            .open_with(&FakeProvider::comics(6), PathBuf::from("long.cbz"))
            .await
            .unwrap();

        match session.render_active(80).unwrap() {
            Some(PageView::Strip(pages)) => assert_eq!(pages.len(), 2),
            other => panic!("unexpected view: {:?}", other),
        }

        session.apply(Command::NextPage { count: 1 }).unwrap();
        assert_eq!(index(&session), 4);
        session.apply(Command::ScrollBy { delta: -1 }).unwrap();
        assert_eq!(index(&session), 3);
    }

    #[test]
    fn cached_pages_are_not_rendered_twice() {
        let backend = fake_backend("cache.cbz", 10);
        let doc = DocumentInstance::new(
            backend.info.clone(),
            backend.clone(),
            page_state(10),
        );
        doc.render_view(false, 80).unwrap();
        doc.render_view(false, 80).unwrap();
        assert_eq!(backend.renders.load(Ordering::SeqCst), 1);

        doc.prefetch_neighbors(2, false, 80).unwrap();
        assert_eq!(backend.renders.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stacking_centres_narrower_pages() {
        let wide = RenderImage {
            width: 2,
            height: 1,
            pixels: vec![1; 8],
        };
        let narrow = RenderImage {
            width: 1,
            height: 2,
            pixels: vec![2; 8],
        };
        let stacked = RenderImage::stack_vertical(&[wide, narrow]);
        assert_eq!(stacked.width, 2);
        assert_eq!(stacked.height, 3 + PAGE_GAP);
        assert_eq!(stacked.pixels.len(), (2 * 4 * (3 + PAGE_GAP)) as usize);
        assert_eq!(&stacked.pixels[0..8], &[1; 8]);
        let first_narrow_row = ((1 + PAGE_GAP) * 2 * 4) as usize;
        assert_eq!(&stacked.pixels[first_narrow_row..first_narrow_row + 4], &[2; 4]);
    }

    #[test]
    fn file_progress_store_keeps_other_entries() {
        let dir = tempdir().unwrap();
        let store = FileProgressStore::new(dir.path().join("state")).unwrap();

        let comic = ProgressRecord {
            format: DocumentFormat::Cbz,
            page: 12,
        };
        let book = ProgressRecord {
            format: DocumentFormat::Epub,
            page: 3,
        };
        store.set("a.cbz", &comic).unwrap();
        store.set("b.epub", &book).unwrap();
        store
            .set(
                "a.cbz",
                &ProgressRecord {
                    format: DocumentFormat::Cbz,
                    page: 13,
                },
            )
            .unwrap();

        assert_eq!(
            store.get("a.cbz", DocumentFormat::Cbz).unwrap().map(|r| r.page),
            Some(13)
        );
        assert_eq!(store.get("b.epub", DocumentFormat::Epub).unwrap(), Some(book));
        assert_eq!(store.get("b.epub", DocumentFormat::Cbz).unwrap(), None);

        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["a.cbz"]["type"], "cbz");
        assert_eq!(value["a.cbz"]["page"], 13);
    }

    #[test]
    fn corrupted_progress_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let store = FileProgressStore::new(dir.path().to_path_buf()).unwrap();
        fs::write(store.path(), "{not json").unwrap();

        assert_eq!(store.get("a.cbz", DocumentFormat::Cbz).unwrap(), None);

        let record = ProgressRecord {
            format: DocumentFormat::Cbz,
            page: 2,
        };
        store.set("a.cbz", &record).unwrap();
        assert_eq!(store.get("a.cbz", DocumentFormat::Cbz).unwrap(), Some(record));
    }

    #[test]
    fn malformed_record_does_not_hide_others() {
        let dir = tempdir().unwrap();
        let store = FileProgressStore::new(dir.path().to_path_buf()).unwrap();
        fs::write(
            store.path(),
            r#"{"odd.cbz": {"page": "seven"}, "fine.cbz": {"type": "cbz", "page": 4}}"#,
        )
        .unwrap();

        assert_eq!(store.get("odd.cbz", DocumentFormat::Cbz).unwrap(), None);
        assert_eq!(
            store.get("fine.cbz", DocumentFormat::Cbz).unwrap().map(|r| r.page),
            Some(4)
        );
    }

    #[test]
    fn file_preference_store_restores_every_key() {
        let dir = tempdir().unwrap();
        let store = FilePreferenceStore::new(dir.path().join("state")).unwrap();
        assert!(store.load().unwrap().is_none());

        let prefs = Preferences {
            reading_mode: ReadingMode::Scroll,
            reverse_direction: true,
            font_size: 140,
            theme: Theme::Dark,
        };
        store.save(&prefs).unwrap();
        assert_eq!(store.load().unwrap(), Some(prefs));

        let raw = fs::read_to_string(dir.path().join("state").join(FilePreferenceStore::FILE_NAME))
            .unwrap();
        assert!(raw.contains("reading_mode = \"scroll\""));
        assert!(raw.contains("reverse_direction = true"));
    }

    #[test]
    fn partial_preferences_fill_in_defaults() {
        let prefs: Preferences = toml::from_str("theme = \"dark\"").unwrap();
        assert_eq!(prefs.theme, Theme::Dark);
        assert_eq!(prefs.reading_mode, ReadingMode::Page);
        assert_eq!(prefs.font_size, 100);
    }
}
