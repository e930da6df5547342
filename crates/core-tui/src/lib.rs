//! The Meta TUI (spec §4.5): a modal full-screen overlay the TTY host hands
//! control to on `ESC`, addressed through a small tagged-enum screen model
//! rather than the original's string-keyed screen registry (REDESIGN FLAGS
//! item 3) — grounded on `examples/original_source/internal/metashell/
//! metamode/{handler,mainScreen,shellListScreen}.go` for transition and
//! parsing semantics, reimplemented against `ratatui`+`crossterm` instead of
//! `bubbletea`.

mod fullscreen;
mod list_screen;
mod main_screen;
mod rpc;

pub use fullscreen::FullscreenScreen;
pub use list_screen::{ListEntry, ListPayload, ListableItem, ListScreen, NextScreen};
pub use main_screen::MainScreen;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;

pub struct MetaTuiConfig {
    pub socket_path: PathBuf,
    pub prompt: String,
    pub plugin_name_delim: String,
}

enum Screen {
    Main(MainScreen),
    List(ListScreen),
    Fullscreen(FullscreenScreen),
}

/// What a screen's key handler decided to do this tick.
enum Transition {
    Stay,
    To(Screen),
    /// Ends the TUI; the payload is written to the PTY master as if typed.
    ShellInjection(String),
}

/// Runs the Meta TUI to completion. Blocks the calling thread (driven by
/// `crossterm::event::poll`, not async I/O) and must be invoked from a
/// `spawn_blocking` context so the RPC calls inside `rpc::*` can reach the
/// tokio runtime via `Handle::block_on`.
///
/// Returns the shell-injection text to write into the PTY master, if the
/// session ended by producing one; `None` on a bare `ESC` quit (spec §4.5).
pub fn run(config: MetaTuiConfig) -> Result<Option<String>> {
    crossterm::execute!(stdout(), crossterm::terminal::EnterAlternateScreen)?;
    let result = run_inner(config);
    crossterm::execute!(stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    result
}

fn run_inner(config: MetaTuiConfig) -> Result<Option<String>> {
    let backend = CrosstermBackend::new(stdout());
    let mut terminal = Terminal::new(backend)?;
    let socket_path = config.socket_path;

    let mut screen = Screen::Main(MainScreen::new(config.prompt, config.plugin_name_delim));

    loop {
        terminal.draw(|frame| {
            let area = frame.area();
            match &screen {
                Screen::Main(s) => s.render(frame, area),
                Screen::List(s) => s.render(frame, area),
                Screen::Fullscreen(s) => s.render(frame, area),
            }
        })?;

        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.code == KeyCode::Esc {
            return Ok(None);
        }

        let transition = match &mut screen {
            Screen::Main(s) => s.handle_key(key, &socket_path),
            Screen::List(s) => s.handle_key(key),
            Screen::Fullscreen(s) => s.handle_key(key),
        };

        match transition {
            Transition::Stay => {}
            Transition::To(next) => screen = next,
            Transition::ShellInjection(text) => return Ok(Some(text)),
        }
    }
}
