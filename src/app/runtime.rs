use std::io::Stdout;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, MouseEventKind};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use super::*;

const IDLE_POLL_MS: u64 = 100;
const SESSIONS_REFRESH_MS: u64 = 2000;
const MAX_EVENTS_PER_FRAME: u16 = 64;

pub(crate) fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    mut app: App,
) -> Result<()> {
    spawn_session_refresh(app.backend.clone(), app.tx.clone());
    app.last_sessions_refresh = Instant::now();

    loop {
        app.poll_worker();

        if app.last_sessions_refresh.elapsed() >= Duration::from_millis(SESSIONS_REFRESH_MS) {
            spawn_session_refresh(app.backend.clone(), app.tx.clone());
            app.last_sessions_refresh = Instant::now();
        }

        terminal.draw(|frame| ui::draw(frame, &mut app))?;

        if app.should_quit {
            break;
        }

        if !event::poll(Duration::from_millis(IDLE_POLL_MS)).context("event poll")? {
            continue;
        }

        let mut drained_events: u16 = 0;
        loop {
            match event::read().context("event read")? {
                Event::Key(key) => app.handle_key(key),
                Event::Mouse(mouse) => match mouse.kind {
                    MouseEventKind::ScrollUp => app.scroll_up(3),
                    MouseEventKind::ScrollDown => app.scroll_down(3),
                    _ => {}
                },
                Event::FocusGained => app.background = false,
                Event::FocusLost => app.background = true,
                Event::Paste(text) => {
                    if app.mode == Mode::Compose {
                        app.input.push_str(&text);
                    }
                }
                Event::Resize(_, _) => {}
            }
            drained_events = drained_events.saturating_add(1);
            if drained_events >= MAX_EVENTS_PER_FRAME {
                break;
            }
            if !event::poll(Duration::from_millis(0)).context("event poll drain")? {
                break;
            }
        }
    }

    app.persist_snapshot();
    Ok(())
}
