use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use super::*;

impl App {
    pub(super) fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.should_quit = true;
            return;
        }
        match self.mode {
            Mode::Normal => self.handle_normal_key(key),
            Mode::Compose => self.handle_compose_key(key),
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Up | KeyCode::Char('k') => self.move_selection(-1),
            KeyCode::Down | KeyCode::Char('j') => self.move_selection(1),
            KeyCode::PageUp => self.scroll_up(10),
            KeyCode::PageDown => self.scroll_down(10),
            KeyCode::End => {
                self.autoscroll = true;
                self.scroll = u16::MAX;
            }
            KeyCode::Char('a') => self.decide_first_pending(true),
            KeyCode::Char('d') => self.decide_first_pending(false),
            KeyCode::Char('x') => self.dismiss_ready_selected(),
            KeyCode::Char('m') => self.interrupt_selected(),
            KeyCode::Char('r') => self.request_refresh(),
            KeyCode::Char('i') | KeyCode::Enter => {
                if self.selected_session().is_some() {
                    self.mode = Mode::Compose;
                    self.set_status("compose (Enter sends, Esc cancels)");
                } else {
                    self.set_status("select a session first");
                }
            }
            _ => {}
        }
    }

    fn handle_compose_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => {
                self.mode = Mode::Normal;
                self.input.clear();
                self.set_status("ready");
            }
            KeyCode::Enter => self.send_current_input(),
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(ch) => self.input.push(ch),
            _ => {}
        }
    }
}
