use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use liber_core::{Command, ReadingMode, RenderImage, Theme};
use png::{BitDepth, ColorType, Encoder};

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    if more { 1 } else { 0 }
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", if more { 1 } else { 0 })?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes every image this renderer placed, e.g. before showing text.
    pub fn delete_images(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Paints up to `rows` lines of text from the top of the screen, coloured
    /// for the theme. Lines beyond the viewport are dropped.
    pub fn draw_text(&mut self, text: &str, start_col: u16, rows: u16, theme: Theme) -> Result<()> {
        let (fg, bg) = theme_colors(theme);
        crossterm::queue!(self.writer, SetForegroundColor(fg), SetBackgroundColor(bg))?;
        for (row, line) in text.lines().take(usize::from(rows)).enumerate() {
            crossterm::queue!(
                self.writer,
                cursor::MoveTo(start_col, row as u16),
                Clear(ClearType::UntilNewLine),
                Print(line)
            )?;
        }
        crossterm::queue!(self.writer, ResetColor)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

pub fn theme_colors(theme: Theme) -> (Color, Color) {
    match theme {
        Theme::Light => (Color::Black, Color::White),
        Theme::Dark => (Color::Grey, Color::Black),
    }
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    BeginOpen,
    PromptChanged { input: String },
    OpenFile { path: PathBuf },
    PromptCancel,
    /// Moves through the current text page by half a screen.
    ScrollText { forward: bool },
    ToggleStatusBar,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Open,
}

/// Turns key presses into reader intents. Digits typed before a motion form
/// a count; before `G` they name the page to jump to.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    reading_mode: ReadingMode,
    prompt_buffer: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.prompt_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Page turns and scrolling share keys; the reading mode decides which
    /// one a key produces.
    pub fn set_reading_mode(&mut self, reading_mode: ReadingMode) {
        self.reading_mode = reading_mode;
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Open => self.map_event_open(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                    if let Some(digit) = c.to_digit(10) {
                        self.push_digit(digit as usize);
                    }
                    UiEvent::None
                }
                (KeyCode::Char('l'), KeyModifiers::NONE)
                | (KeyCode::Char('j'), KeyModifiers::NONE)
                | (KeyCode::Char(' '), KeyModifiers::NONE)
                | (KeyCode::Right, KeyModifiers::NONE)
                | (KeyCode::Down, KeyModifiers::NONE)
                | (KeyCode::PageDown, _) => self.forward(),
                (KeyCode::Char('h'), KeyModifiers::NONE)
                | (KeyCode::Char('k'), KeyModifiers::NONE)
                | (KeyCode::Left, KeyModifiers::NONE)
                | (KeyCode::Up, KeyModifiers::NONE)
                | (KeyCode::PageUp, _) => self.backward(),
                (KeyCode::Char('G'), modifiers)
                    if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
                {
                    match self.pending_count.take() {
                        Some(page) => {
                            self.pending_digits.clear();
                            UiEvent::Command(Command::GotoPage { page })
                        }
                        None => UiEvent::Command(Command::GotoLastPage),
                    }
                }
                (KeyCode::End, _) => {
                    self.reset_count();
                    UiEvent::Command(Command::GotoLastPage)
                }
                (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                    self.reset_count();
                    UiEvent::Command(Command::GotoPage { page: 1 })
                }
                (KeyCode::Char('s'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::ToggleReadingMode)
                }
                (KeyCode::Char('r'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::ToggleDirection)
                }
                (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => {
                    self.reset_count();
                    UiEvent::Command(Command::AdjustFontSize {
                        delta: liber_core::Preferences::FONT_SIZE_STEP,
                    })
                }
                (KeyCode::Char('-'), _) => {
                    self.reset_count();
                    UiEvent::Command(Command::AdjustFontSize {
                        delta: -liber_core::Preferences::FONT_SIZE_STEP,
                    })
                }
                (KeyCode::Char('d'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::ToggleTheme)
                }
                (KeyCode::Char('b'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::ToggleStatusBar
                }
                (KeyCode::Char('o'), KeyModifiers::NONE) => {
                    self.set_mode(InputMode::Open);
                    UiEvent::BeginOpen
                }
                (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                (KeyCode::Char('d'), KeyModifiers::CONTROL) => {
                    self.reset_count();
                    UiEvent::ScrollText { forward: true }
                }
                (KeyCode::Char('u'), KeyModifiers::CONTROL) => {
                    self.reset_count();
                    UiEvent::ScrollText { forward: false }
                }
                (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_open(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) => {
                    self.set_mode(InputMode::Normal);
                    UiEvent::PromptCancel
                }
                (KeyCode::Enter, _) => {
                    let input = self.prompt_buffer.trim().to_string();
                    self.set_mode(InputMode::Normal);
                    if input.is_empty() {
                        UiEvent::PromptCancel
                    } else {
                        UiEvent::OpenFile {
                            path: PathBuf::from(input),
                        }
                    }
                }
                (KeyCode::Backspace, _) => {
                    self.prompt_buffer.pop();
                    UiEvent::PromptChanged {
                        input: self.prompt_buffer.clone(),
                    }
                }
                (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                    self.prompt_buffer.push(c);
                    UiEvent::PromptChanged {
                        input: self.prompt_buffer.clone(),
                    }
                }
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn forward(&mut self) -> UiEvent {
        let count = self.take_count();
        match self.reading_mode {
            ReadingMode::Page => UiEvent::Command(Command::NextPage { count }),
            ReadingMode::Scroll => UiEvent::Command(Command::ScrollBy {
                delta: count as isize,
            }),
        }
    }

    fn backward(&mut self) -> UiEvent {
        let count = self.take_count();
        match self.reading_mode {
            ReadingMode::Page => UiEvent::Command(Command::PrevPage { count }),
            ReadingMode::Scroll => UiEvent::Command(Command::ScrollBy {
                delta: -(count as isize),
            }),
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if matches!(self.mode, InputMode::Open) {
            return Some(format!("open: {}", self.prompt_buffer));
        }
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
