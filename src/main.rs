use std::fs;
use std::io::Stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossterm::event::{
    DisableBracketedPaste, DisableFocusChange, DisableMouseCapture, EnableBracketedPaste,
    EnableFocusChange, EnableMouseCapture,
};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tracing_subscriber::EnvFilter;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

mod app;
mod backend;
mod store;

use backend::{DefaultCompletionPolicy, FileBackend};
use store::StateStore;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-v" => {
                println!("agentdeck {}", APP_VERSION);
                return Ok(());
            }
            unknown => {
                eprintln!("unknown argument: {}", unknown);
                std::process::exit(2);
            }
        }
    }

    init_logging();

    let backend = Arc::new(FileBackend::open_default()?);
    let policy = Box::new(DefaultCompletionPolicy::from_env());
    let store = StateStore::open_default().ok();
    let app = app::App::new(backend, policy, store);

    let mut terminal = setup_terminal()?;
    let result = app::run_app(&mut terminal, app);
    restore_terminal(&mut terminal)?;
    result
}

/// File-based logging so tracing output never corrupts the alternate screen.
/// Controlled by AGENTDECK_LOG (env-filter syntax), off when unset.
fn init_logging() {
    let Ok(filter) = std::env::var("AGENTDECK_LOG") else {
        return;
    };
    let path = log_file_path();
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(file) = fs::OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
}

fn log_file_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".agentdeck").join("agentdeck.log")
    } else {
        PathBuf::from(".agentdeck").join("agentdeck.log")
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode().context("enable raw mode")?;
    crossterm::execute!(
        std::io::stdout(),
        EnterAlternateScreen,
        EnableMouseCapture,
        EnableFocusChange,
        EnableBracketedPaste
    )
    .context("enter alternate screen")?;
    let mut terminal =
        Terminal::new(CrosstermBackend::new(std::io::stdout())).context("create terminal")?;
    terminal.hide_cursor().ok();
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode().context("disable raw mode")?;
    crossterm::execute!(
        std::io::stdout(),
        LeaveAlternateScreen,
        DisableMouseCapture,
        DisableFocusChange,
        DisableBracketedPaste
    )
    .context("leave alternate screen")?;
    terminal.show_cursor().ok();
    Ok(())
}

/// Milliseconds since the Unix epoch; the timestamp unit used everywhere.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Width-aware truncation with an ellipsis, for fixed-width panes.
pub(crate) fn truncate(text: &str, max_width: usize) -> String {
    if max_width == 0 {
        return String::new();
    }
    if UnicodeWidthStr::width(text) <= max_width {
        return text.to_string();
    }
    let mut width = 0usize;
    let mut out = String::new();
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if width + w > max_width.saturating_sub(1) {
            break;
        }
        width += w;
        out.push(ch);
    }
    out.push('…');
    out
}
