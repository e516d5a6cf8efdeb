use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use liber_core::{
    Command, FilePreferenceStore, FileProgressStore, MemoryPreferenceStore, MemoryProgressStore,
    PageContent, PreferenceOverrides, PreferenceStore, ProgressStore, ReaderState, ReadingMode,
    RenderImage, Session, Theme,
};
use liber_render::FormatProvider;
use liber_tty::{write_status_line, DrawParams, EventMapper, KittyRenderer, UiEvent};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "liber",
    version,
    about = "Terminal reader for comic archives and e-books"
)]
struct Args {
    /// Page to open the document on (1-based), instead of the saved position
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Reading mode for this run
    #[arg(short = 'm', long = "mode", value_enum)]
    mode: Option<ModeArg>,

    /// Read right to left
    #[arg(short = 'r', long = "reverse")]
    reverse: bool,

    /// Colour theme for this run
    #[arg(short = 't', long = "theme", value_enum)]
    theme: Option<ThemeArg>,

    /// Keep progress and preferences in memory only
    #[arg(long = "no-persist")]
    no_persist: bool,

    /// Directory for progress, preferences and logs
    #[arg(long = "state-dir", value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Print what would be opened and where reading resumes, then exit
    #[arg(long = "dump")]
    dump: bool,

    /// A .cbz or .epub file
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Page,
    Scroll,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ThemeArg {
    Light,
    Dark,
}

impl Args {
    /// Flags win over stored preferences for this run only.
    fn overrides(&self) -> PreferenceOverrides {
        PreferenceOverrides {
            reading_mode: self.mode.map(|mode| match mode {
                ModeArg::Page => ReadingMode::Page,
                ModeArg::Scroll => ReadingMode::Scroll,
            }),
            reverse_direction: self.reverse.then_some(true),
            theme: self.theme.map(|theme| match theme {
                ThemeArg::Light => Theme::Light,
                ThemeArg::Dark => Theme::Dark,
            }),
        }
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = match &args.state_dir {
        Some(dir) => dir.clone(),
        None => ProjectDirs::from("net", "liber", "liber")
            .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?
            .data_local_dir()
            .to_path_buf(),
    };
    let _log_guard = init_logging(&data_dir)?;

    let (progress, preference_store): (Arc<dyn ProgressStore>, Arc<dyn PreferenceStore>) =
        if args.no_persist {
            (
                Arc::new(MemoryProgressStore::new()),
                Arc::new(MemoryPreferenceStore::new()),
            )
        } else {
            let state_dir = data_dir.join("state");
            (
                Arc::new(FileProgressStore::new(state_dir.clone())?),
                Arc::new(FilePreferenceStore::new(state_dir)?),
            )
        };

    let mut session = Session::with_overrides(progress, preference_store, args.overrides());
    let provider = FormatProvider::new();

    let mut message = None;
    if let Some(path) = &args.file {
        message = open_document(&mut session, &provider, path.clone()).await;
        if let Some(page) = args.page {
            session.apply(Command::GotoPage { page })?;
        }
    }

    if args.dump {
        print_summary(&session, args.file.as_deref(), message.as_deref());
        return Ok(());
    }

    run(session, provider, message).await
}

async fn run(mut session: Session, provider: FormatProvider, message: Option<String>) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut event_mapper = EventMapper::new();
    let mut view = ViewState {
        show_status: true,
        message,
        text_offset: 0,
        text_page: None,
        text_rows: 0,
    };
    let mut dirty = true;

    loop {
        event_mapper.set_reading_mode(session.preferences().reading_mode);

        if dirty {
            let pending = event_mapper.pending_input();
            redraw(&mut renderer, &session, &mut view, pending.as_deref())?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(100))? {
            let ev = event::read()?;
            if matches!(ev, Event::Resize(..)) {
                dirty = true;
                continue;
            }
            let ui_event = event_mapper.map_event(ev);
            match handle_event(ui_event, &mut session, &provider, &mut view).await? {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {
                    if let Some(status) = status_text(&session, &view, event_mapper.pending_input().as_deref()) {
                        draw_status_line(&mut renderer, &status)?;
                    }
                }
                LoopAction::Quit => break,
            }
        }
    }

    renderer.delete_images()?;
    renderer.clear_all()?;
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

struct ViewState {
    show_status: bool,
    message: Option<String>,
    /// First visible line of a text page; reset when the page changes.
    text_offset: usize,
    text_page: Option<usize>,
    text_rows: usize,
}

/// Opens a file and reports anything the reader should see on the status
/// line. Failures are logged, never fatal.
async fn open_document(
    session: &mut Session,
    provider: &FormatProvider,
    path: PathBuf,
) -> Option<String> {
    match session.open_with(provider, path.clone()).await {
        Ok(true) => None,
        Ok(false) => {
            info!(?path, "file type not handled");
            Some("not a .cbz or .epub file".to_string())
        }
        Err(err) => {
            warn!(?err, ?path, "failed to open document");
            Some(format!("{:#}", err))
        }
    }
}

async fn handle_event(
    event: UiEvent,
    session: &mut Session,
    provider: &FormatProvider,
    view: &mut ViewState,
) -> Result<LoopAction> {
    match event {
        UiEvent::Command(cmd) => {
            view.message = None;
            session.apply(cmd)?;
            let redraw = session
                .events()
                .lock()
                .drain(..)
                .any(|event| matches!(event, liber_core::SessionEvent::RedrawNeeded));
            if redraw {
                Ok(LoopAction::ContinueRedraw)
            } else {
                Ok(LoopAction::Continue)
            }
        }
        UiEvent::BeginOpen | UiEvent::PromptChanged { .. } => Ok(LoopAction::Continue),
        UiEvent::PromptCancel => Ok(LoopAction::ContinueRedraw),
        UiEvent::OpenFile { path } => {
            view.message = open_document(session, provider, path).await;
            view.text_page = None;
            session.events().lock().clear();
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::ScrollText { forward } => {
            let step = (view.text_rows / 2).max(1);
            view.text_offset = if forward {
                view.text_offset.saturating_add(step)
            } else {
                view.text_offset.saturating_sub(step)
            };
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::ToggleStatusBar => {
            view.show_status = !view.show_status;
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::Quit => Ok(LoopAction::Quit),
        UiEvent::None => Ok(LoopAction::Continue),
    }
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &Session,
    view: &mut ViewState,
    pending_input: Option<&str>,
) -> Result<()> {
    let window = terminal::window_size()?;
    let total_cols = u32::from(window.columns).max(1);
    let total_rows = u32::from(window.rows).max(1);
    let reserved_rows = if view.show_status { 1 } else { 0 };
    let content_rows = total_rows.saturating_sub(reserved_rows).max(1);

    renderer.begin_sync_update()?;
    renderer.delete_images()?;
    {
        let mut writer = renderer.writer();
        crossterm::execute!(&mut writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }

    let rendered = session.render_active(window.columns);
    match rendered {
        Ok(Some(page_view)) => match page_view.into_content() {
            PageContent::Image(image) => {
                let (draw_cols, draw_rows) = compute_scaled_dimensions(
                    &image,
                    total_cols,
                    content_rows,
                    u32::from(window.width),
                    u32::from(window.height),
                    total_rows,
                );
                let start_col = total_cols.saturating_sub(draw_cols) / 2;
                let start_row = content_rows.saturating_sub(draw_rows) / 2;
                {
                    let mut writer = renderer.writer();
                    crossterm::execute!(
                        &mut writer,
                        cursor::MoveTo(start_col as u16, start_row as u16)
                    )?;
                }
                renderer.draw(&image, DrawParams::clamped(draw_cols, draw_rows))?;
            }
            PageContent::Text(text) => {
                let page = session.active().map(|doc| doc.state.index);
                if view.text_page != page {
                    view.text_page = page;
                    view.text_offset = 0;
                }
                let line_count = text.lines().count();
                view.text_offset = view.text_offset.min(line_count.saturating_sub(1));
                view.text_rows = content_rows as usize;
                let visible: Vec<&str> = text.lines().skip(view.text_offset).collect();
                let width = session.preferences().text_width(window.columns) as u32;
                let start_col = total_cols.saturating_sub(width) / 2;
                renderer.draw_text(
                    &visible.join("\n"),
                    start_col as u16,
                    content_rows as u16,
                    session.preferences().theme,
                )?;
            }
        },
        Ok(None) => {
            if view.message.is_none() {
                view.message = Some(match session.active() {
                    Some(doc) => format!("{} has no pages", doc.info.name),
                    None => "press o to open a .cbz or .epub file".to_string(),
                });
            }
        }
        Err(err) => {
            warn!(?err, "failed to render page");
            view.message = Some(format!("{:#}", err));
        }
    }

    if let Some(status) = status_text(session, view, pending_input) {
        draw_status_line(renderer, &status)?;
    }
    renderer.end_sync_update()?;

    if let Err(err) = session.prefetch(2, window.columns) {
        warn!(?err, "failed to prefetch neighbouring pages");
    }
    Ok(())
}

fn status_text(session: &Session, view: &ViewState, pending_input: Option<&str>) -> Option<String> {
    if !view.show_status {
        return pending_input.map(str::to_string);
    }
    let mut parts = Vec::new();
    if let Some(doc) = session.active() {
        let prefs = session.preferences();
        parts.push(format!(
            "{} | page {} | {} | {} | {}%",
            doc.info.display_title(),
            page_label(&doc.state),
            doc.state.mode.as_str(),
            if doc.state.reverse { "rtl" } else { "ltr" },
            prefs.font_size
        ));
    }
    if let Some(message) = &view.message {
        parts.push(message.clone());
    }
    if let Some(pending) = pending_input.filter(|s| !s.is_empty()) {
        parts.push(pending.to_string());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let total_rows = u32::from(window.rows).max(1);
    let status_row = total_rows.saturating_sub(1);
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(&mut writer, status)?;
    Ok(())
}

/// `current/total`, 1-based; an empty document reads `0/0`.
fn page_label(state: &ReaderState) -> String {
    let current = if state.total == 0 { 0 } else { state.index + 1 };
    format!("{}/{}", current, state.total)
}

fn print_summary(session: &Session, file: Option<&Path>, message: Option<&str>) {
    match session.active() {
        Some(doc) => {
            println!(
                "{}: {}, {} pages, at page {}",
                doc.info.name,
                doc.info.format.as_str(),
                doc.info.page_count,
                page_label(&doc.state)
            );
            let prefs = session.preferences();
            println!(
                "mode: {}, direction: {}, theme: {}, font size: {}%",
                prefs.reading_mode.as_str(),
                if prefs.reverse_direction { "rtl" } else { "ltr" },
                if prefs.theme.is_dark() { "dark" } else { "light" },
                prefs.font_size
            );
        }
        None => {
            let name = file
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "no file".to_string());
            println!("{}: {}", name, message.unwrap_or("nothing to open"));
        }
    }
}

fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
    let log_dir = data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "liber.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

/// Fits the image into the content area, keeping its aspect ratio. Without
/// pixel metrics from the terminal, assumes cells twice as tall as wide.
fn compute_scaled_dimensions(
    image: &RenderImage,
    available_cols: u32,
    available_rows: u32,
    pixel_width: u32,
    pixel_height: u32,
    total_rows: u32,
) -> (u32, u32) {
    let available_cols = available_cols.max(1);
    let available_rows = available_rows.max(1);
    if image.width == 0 || image.height == 0 {
        return (available_cols, available_rows);
    }

    let (cell_width, cell_height) = if pixel_width > 0 && pixel_height > 0 && total_rows > 0 {
        (
            pixel_width as f32 / available_cols as f32,
            pixel_height as f32 / total_rows as f32,
        )
    } else {
        (1.0, 2.0)
    };

    let cols_for_full_height = image.width as f32 / image.height as f32
        * (available_rows as f32 * cell_height)
        / cell_width;
    if cols_for_full_height <= available_cols as f32 {
        let cols = cols_for_full_height.round().max(1.0) as u32;
        (cols.min(available_cols), available_rows)
    } else {
        let rows = image.height as f32 / image.width as f32
            * (available_cols as f32 * cell_width)
            / cell_height;
        let rows = rows.round().max(1.0) as u32;
        (available_cols, rows.min(available_rows))
    }
}
