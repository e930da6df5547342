//! A selectable list, populated either from items the creating screen
//! already had in hand or from a plugin's JSON-encoded
//! `SHELL_INJECTION_LIST` response (spec §4.5). Both collapse to the same
//! `Vec<ListEntry>` before rendering; only the construction path differs,
//! mirroring the dual-payload shape of `listScreen`/`listableItem` in
//! `examples/original_source/internal/metashell/metamode/shellListScreen.go`.

use crate::main_screen::MainScreen;
use crate::{Screen, Transition};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::layout::Rect;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState};
use ratatui::Frame;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ListableItem {
    pub title: String,
    pub description: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub filter_value: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub title: String,
    pub description: String,
    pub value: String,
}

/// Either already-typed items forwarded from the main screen's own
/// completion table, or bytes a plugin returned that still need JSON
/// decoding — the sum type named in REDESIGN FLAGS item 4.
pub enum ListPayload {
    Items(Vec<ListEntry>),
    EncodedItems(Vec<u8>),
}

impl ListPayload {
    pub fn into_entries(self) -> Vec<ListEntry> {
        match self {
            ListPayload::Items(items) => items,
            ListPayload::EncodedItems(bytes) => {
                let items: Vec<ListableItem> = serde_json::from_slice(&bytes).unwrap_or_default();
                items
                    .into_iter()
                    .map(|i| ListEntry {
                        title: i.title,
                        description: i.description,
                        value: i.value,
                    })
                    .collect()
            }
        }
    }
}

/// Which screen a selection transitions to, and with what payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextScreen {
    /// Completion pick from the main screen: selecting fills the input.
    Main,
    /// `SHELL_INJECTION_LIST` pick: selecting ends the TUI, writing
    /// `item.value` to the PTY master.
    ShellInjection,
}

pub struct ListScreen {
    entries: Vec<ListEntry>,
    selected: usize,
    next: NextScreen,
    prompt: String,
    delim: String,
}

impl ListScreen {
    pub fn new(entries: Vec<ListEntry>, next: NextScreen) -> Self {
        Self {
            entries,
            selected: 0,
            next,
            prompt: String::new(),
            delim: String::new(),
        }
    }

    /// Carries the main screen's prompt/delimiter along so a `NextScreen::Main`
    /// selection can rebuild it without a further round trip to the daemon.
    pub fn from_main(entries: Vec<ListEntry>, next: NextScreen, main: &MainScreen) -> Self {
        Self {
            entries,
            selected: 0,
            next,
            prompt: main.prompt.clone(),
            delim: main.delim.clone(),
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Transition {
        match key.code {
            KeyCode::Up => {
                self.selected = self.selected.saturating_sub(1);
                Transition::Stay
            }
            KeyCode::Down => {
                if self.selected + 1 < self.entries.len() {
                    self.selected += 1;
                }
                Transition::Stay
            }
            KeyCode::Enter => self.select(),
            _ => Transition::Stay,
        }
    }

    fn select(&mut self) -> Transition {
        let Some(entry) = self.entries.get(self.selected) else {
            return Transition::Stay;
        };
        match self.next {
            NextScreen::ShellInjection => Transition::ShellInjection(entry.value.clone()),
            NextScreen::Main => Transition::To(Screen::Main(MainScreen::with_input(
                self.prompt.clone(),
                self.delim.clone(),
                entry.value.clone(),
            ))),
        }
    }

    pub fn render(&self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = self
            .entries
            .iter()
            .map(|e| ListItem::new(format!("{}  {}", e.title, e.description)))
            .collect();
        let block = Block::default().borders(Borders::ALL).title("select");
        let list = List::new(items)
            .block(block)
            .highlight_style(Style::default().add_modifier(Modifier::BOLD).fg(Color::Yellow))
            .highlight_symbol("> ");
        let mut state = ListState::default();
        state.select(Some(self.selected));
        frame.render_stateful_widget(list, area, &mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState, KeyModifiers};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    fn entries() -> Vec<ListEntry> {
        vec![
            ListEntry { title: "a".into(), description: "".into(), value: "a-value".into() },
            ListEntry { title: "b".into(), description: "".into(), value: "b-value".into() },
        ]
    }

    #[test]
    fn down_does_not_run_past_the_last_entry() {
        let mut screen = ListScreen::new(entries(), NextScreen::Main);
        screen.handle_key(key(KeyCode::Down));
        screen.handle_key(key(KeyCode::Down));
        screen.handle_key(key(KeyCode::Down));
        assert_eq!(screen.selected, 1);
    }

    #[test]
    fn up_saturates_at_zero() {
        let mut screen = ListScreen::new(entries(), NextScreen::Main);
        screen.handle_key(key(KeyCode::Up));
        assert_eq!(screen.selected, 0);
    }

    #[test]
    fn shell_injection_selection_transitions_with_the_entry_value() {
        let mut screen = ListScreen::new(entries(), NextScreen::ShellInjection);
        match screen.handle_key(key(KeyCode::Enter)) {
            Transition::ShellInjection(value) => assert_eq!(value, "a-value"),
            _ => panic!("expected a shell injection transition"),
        }
    }

    #[test]
    fn main_selection_rebuilds_the_main_screen_with_the_entry_value_as_input() {
        let mut screen = ListScreen::new(entries(), NextScreen::Main);
        match screen.handle_key(key(KeyCode::Enter)) {
            Transition::To(Screen::Main(main)) => assert_eq!(main.input, "a-value"),
            _ => panic!("expected a transition into the main screen"),
        }
    }

    #[test]
    fn encoded_items_decode_from_json() {
        let json = br#"[{"title":"t","description":"d","value":"v"}]"#.to_vec();
        let decoded = ListPayload::EncodedItems(json).into_entries();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].value, "v");
    }

    #[test]
    fn malformed_encoded_items_yield_an_empty_list_rather_than_a_panic() {
        let decoded = ListPayload::EncodedItems(b"not json".to_vec()).into_entries();
        assert!(decoded.is_empty());
    }
}
