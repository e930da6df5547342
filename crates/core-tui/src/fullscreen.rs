//! Renders an arbitrary `SCREEN`-format metacommand response as plain text
//! (spec §4.5). Any key returns to the main screen; nothing here reaches the
//! daemon.

use crate::main_screen::MainScreen;
use crate::{Screen, Transition};
use crossterm::event::KeyEvent;
use ratatui::layout::Rect;
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Frame;

pub struct FullscreenScreen {
    content: String,
    prompt: String,
    delim: String,
}

impl FullscreenScreen {
    pub fn new(content: String) -> Self {
        Self {
            content,
            prompt: String::new(),
            delim: String::new(),
        }
    }

    pub fn from_main(content: String, main: &MainScreen) -> Self {
        Self {
            content,
            prompt: main.prompt.clone(),
            delim: main.delim.clone(),
        }
    }

    pub fn handle_key(&mut self, _key: KeyEvent) -> Transition {
        Transition::To(Screen::Main(MainScreen::new(
            self.prompt.clone(),
            self.delim.clone(),
        )))
    }

    pub fn render(&self, frame: &mut Frame, area: Rect) {
        let block = Block::default().borders(Borders::ALL).title("plugin screen");
        frame.render_widget(Paragraph::new(self.content.as_str()).block(block), area);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyCode, KeyEventKind, KeyEventState, KeyModifiers};

    #[test]
    fn any_key_returns_to_the_main_screen_with_the_carried_prompt() {
        let mut screen = FullscreenScreen {
            content: "output".into(),
            prompt: "$ ".into(),
            delim: "::".into(),
        };
        let key = KeyEvent {
            code: KeyCode::Char('q'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        };
        match screen.handle_key(key) {
            Transition::To(Screen::Main(main)) => assert_eq!(main.prompt, "$ "),
            _ => panic!("expected a transition back to the main screen"),
        }
    }
}
