//! The entry screen: a single-line input parsed as
//! `plugin<DELIM>metacommand arg1 arg2…` (spec §4.5), with `TAB` opening a
//! completion list and `ENTER` dispatching the parsed metacommand.

use crate::list_screen::{ListEntry, ListScreen, NextScreen};
use crate::{FullscreenScreen, Screen, Transition};
use core_protocol::{GetPluginInfoRequest, MetacommandRequest, PluginSummary, ResponseFormat};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::layout::Rect;
use ratatui::style::{Color, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Frame;
use std::path::Path;

pub struct MainScreen {
    pub prompt: String,
    pub delim: String,
    pub input: String,
    /// Last `GetPluginInfo("", "")` result, refreshed on `TAB`; matches
    /// `mainScreen::updatePlugins` building its completion table from the
    /// always-matches-everything empty-prefix call (SPEC_FULL.md §2).
    pub plugins: Vec<PluginSummary>,
    pub status: Option<String>,
}

impl MainScreen {
    pub fn new(prompt: String, delim: String) -> Self {
        Self {
            prompt,
            delim,
            input: String::new(),
            plugins: Vec::new(),
            status: None,
        }
    }

    pub fn with_input(prompt: String, delim: String, input: String) -> Self {
        Self {
            input,
            ..Self::new(prompt, delim)
        }
    }

    /// Splits `"plugin<DELIM>metacommand arg1 arg2…"`. `None` if the
    /// delimiter never appears.
    fn parsed_input(&self) -> Option<(String, String, Vec<String>)> {
        let (head, rest) = self.input.split_once(&self.delim)?;
        let mut parts = rest.split_whitespace();
        let metacommand = parts.next()?.to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();
        Some((head.to_string(), metacommand, args))
    }

    fn lookup_format(&self, plugin: &str, metacommand: &str) -> Option<ResponseFormat> {
        self.plugins
            .iter()
            .find(|p| p.name == plugin)?
            .metacommands
            .iter()
            .find(|m| m.name == metacommand)
            .map(|m| m.format)
    }

    pub fn handle_key(&mut self, key: KeyEvent, socket_path: &Path) -> Transition {
        match key.code {
            KeyCode::Char(c) => {
                self.input.push(c);
                Transition::Stay
            }
            KeyCode::Backspace => {
                self.input.pop();
                Transition::Stay
            }
            KeyCode::Tab => self.open_completions(socket_path),
            KeyCode::Enter => self.execute(socket_path),
            _ => Transition::Stay,
        }
    }

    fn open_completions(&mut self, socket_path: &Path) -> Transition {
        self.plugins = crate::rpc::get_plugin_info(
            socket_path,
            GetPluginInfoRequest {
                plugin_name_prefix: String::new(),
                metacommand_name_prefix: String::new(),
            },
        )
        .map(|r| r.plugins)
        .unwrap_or_default();

        let delim = self.delim.clone();
        let entries: Vec<ListEntry> = self
            .plugins
            .iter()
            .flat_map(|p| p.metacommands.iter().map(move |m| (p, m)))
            .map(|(p, m)| (p, format!("{}{}{}", p.name, delim, m.name)))
            .filter(|(_, value)| value.starts_with(&self.input))
            .map(|(p, value)| ListEntry {
                title: value.clone(),
                description: format!("{} v{}", p.name, p.version),
                value,
            })
            .collect();

        Transition::To(Screen::List(ListScreen::from_main(
            entries,
            NextScreen::Main,
            self,
        )))
    }

    fn execute(&mut self, socket_path: &Path) -> Transition {
        let Some((plugin, metacommand, args)) = self.parsed_input() else {
            self.status = Some("input must be plugin<delim>metacommand".to_string());
            return Transition::Stay;
        };

        let format = self.lookup_format(&plugin, &metacommand);
        let format_args = match format {
            Some(ResponseFormat::Screen) => {
                let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
                vec![format!("size={cols}x{rows}")]
            }
            _ => Vec::new(),
        };

        let response = crate::rpc::metacommand(
            socket_path,
            MetacommandRequest {
                plugin_name: plugin.clone(),
                meta_command: metacommand.clone(),
                args,
                format_args,
            },
        );

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.status = Some(e.to_string());
                return Transition::Stay;
            }
        };
        if let Some(err) = response.error {
            self.status = Some(err);
            return Transition::Stay;
        }

        match format {
            Some(ResponseFormat::ShellInjection) | None => {
                Transition::ShellInjection(String::from_utf8_lossy(&response.data).into_owned())
            }
            Some(ResponseFormat::ShellInjectionList) => {
                let entries = crate::list_screen::ListPayload::EncodedItems(response.data)
                    .into_entries();
                Transition::To(Screen::List(ListScreen::from_main(
                    entries,
                    NextScreen::ShellInjection,
                    self,
                )))
            }
            Some(ResponseFormat::Screen) => Transition::To(Screen::Fullscreen(
                FullscreenScreen::from_main(String::from_utf8_lossy(&response.data).into_owned(), self),
            )),
        }
    }

    pub fn render(&self, frame: &mut Frame, area: Rect) {
        let text = format!("{}{}", self.prompt, self.input);
        let block = Block::default().borders(Borders::ALL).title("metashell");
        frame.render_widget(Paragraph::new(text).block(block), area);

        if let Some(status) = &self.status {
            let status_area = Rect {
                y: area.y + area.height.saturating_sub(1),
                height: 1,
                ..area
            };
            frame.render_widget(
                Paragraph::new(Line::from(status.as_str())).style(Style::default().fg(Color::Red)),
                status_area,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plugin_metacommand_and_args() {
        let screen = MainScreen::with_input("> ".into(), "::".into(), "git::last foo bar".into());
        let (plugin, metacommand, args) = screen.parsed_input().unwrap();
        assert_eq!(plugin, "git");
        assert_eq!(metacommand, "last");
        assert_eq!(args, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn parses_metacommand_with_no_args() {
        let screen = MainScreen::with_input("> ".into(), "::".into(), "git::last".into());
        let (plugin, metacommand, args) = screen.parsed_input().unwrap();
        assert_eq!(plugin, "git");
        assert_eq!(metacommand, "last");
        assert!(args.is_empty());
    }

    #[test]
    fn missing_delimiter_fails_to_parse() {
        let screen = MainScreen::with_input("> ".into(), "::".into(), "not a metacommand".into());
        assert!(screen.parsed_input().is_none());
    }

    #[test]
    fn lookup_format_finds_a_declared_metacommand() {
        let mut screen = MainScreen::new("> ".into(), "::".into());
        screen.plugins = vec![PluginSummary {
            name: "git".into(),
            version: "1.0".into(),
            accepts_command_reports: false,
            metacommands: vec![core_protocol::MetacommandInfo {
                name: "last".into(),
                format: ResponseFormat::ShellInjection,
            }],
        }];
        assert_eq!(screen.lookup_format("git", "last"), Some(ResponseFormat::ShellInjection));
        assert_eq!(screen.lookup_format("git", "nope"), None);
        assert_eq!(screen.lookup_format("nope", "last"), None);
    }
}
