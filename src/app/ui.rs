use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block as Panel, BorderType, Borders, Padding, Paragraph, Wrap};
use ratatui::Frame;

use super::types::{Block, BlockKind, RecentsBadge, RowKind};
use super::{App, Mode};
use crate::truncate;

const SIDEBAR_WIDTH: u16 = 34;

pub(super) fn draw(f: &mut Frame, app: &mut App) {
    let area = f.area();
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(20)])
        .split(area);

    draw_sidebar(f, app, columns[0]);

    let compose_h: u16 = if app.mode == Mode::Compose { 3 } else { 0 };
    let mut constraints = vec![Constraint::Min(3)];
    if compose_h > 0 {
        constraints.push(Constraint::Length(compose_h));
    }
    constraints.push(Constraint::Length(1));
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(columns[1]);

    draw_transcript(f, app, rows[0]);
    if compose_h > 0 {
        draw_compose(f, app, rows[1]);
    }
    draw_status(f, app, rows[rows.len() - 1]);
}

fn badge_span(badge: RecentsBadge) -> Span<'static> {
    match badge {
        RecentsBadge::Running => Span::styled("● ", Style::default().fg(Color::Yellow)),
        RecentsBadge::Ready => Span::styled("✓ ", Style::default().fg(Color::Green)),
        RecentsBadge::None => Span::raw("  "),
    }
}

fn draw_sidebar(f: &mut Frame, app: &App, area: Rect) {
    let inner_width = area.width.saturating_sub(4) as usize;
    let mut lines: Vec<Line<'static>> = Vec::with_capacity(app.rows.len());
    for (idx, row) in app.rows.iter().enumerate() {
        let selected = Some(idx) == app.selected;
        let indent = match row.kind {
            RowKind::Workspace => "",
            RowKind::Worktree => "  ",
            RowKind::Session => "    ",
        };
        let mut spans = vec![Span::raw(indent.to_string())];
        if row.kind == RowKind::Session {
            spans.push(badge_span(row.badge));
        }
        let label = truncate(&row.label, inner_width.saturating_sub(indent.len() + 2));
        let style = match (selected, row.kind) {
            (true, _) => Style::default().add_modifier(Modifier::REVERSED),
            (false, RowKind::Workspace) => Style::default().add_modifier(Modifier::BOLD),
            (false, RowKind::Worktree) => Style::default().fg(Color::Cyan),
            (false, RowKind::Session) => Style::default(),
        };
        spans.push(Span::styled(label, style));
        lines.push(Line::from(spans));
    }
    let title = format!(
        "sessions ({} running, {} ready)",
        app.recents.running_count(),
        app.recents.ready_count()
    );
    let sidebar = Paragraph::new(Text::from(lines)).block(panel(&title));
    f.render_widget(sidebar, area);
}

fn block_line(block: &Block) -> Vec<Line<'static>> {
    let (tag, style) = match block.kind {
        BlockKind::User => ("you", Style::default().fg(Color::Cyan)),
        BlockKind::Agent => ("agent", Style::default().fg(Color::Green)),
        BlockKind::Reasoning => (
            "thinking",
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        ),
        BlockKind::Tool => ("tool", Style::default().fg(Color::Magenta)),
        BlockKind::System => ("system", Style::default().fg(Color::DarkGray)),
        BlockKind::Error => ("error", Style::default().fg(Color::Red)),
        BlockKind::Approval => (
            "approval",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    };
    let mut lines = Vec::new();
    for (i, part) in block.text.lines().enumerate() {
        if i == 0 {
            lines.push(Line::from(vec![
                Span::styled(format!("{tag:>8} "), style),
                Span::raw(part.to_string()),
            ]));
        } else {
            lines.push(Line::from(vec![
                Span::raw(" ".repeat(9)),
                Span::raw(part.to_string()),
            ]));
        }
    }
    if lines.is_empty() {
        lines.push(Line::from(Span::styled(format!("{tag:>8} "), style)));
    }
    lines
}

fn draw_transcript(f: &mut Frame, app: &mut App, area: Rect) {
    let mut lines: Vec<Line<'static>> = Vec::new();
    for block in app.visible_blocks() {
        lines.extend(block_line(block));
        lines.push(Line::default());
    }

    let inner_height = area.height.saturating_sub(2);
    let paragraph = Paragraph::new(Text::from(lines)).wrap(Wrap { trim: false });
    let total = paragraph.line_count(area.width.saturating_sub(2).max(1)) as u16;
    let max_scroll = total.saturating_sub(inner_height);
    if app.autoscroll || app.scroll > max_scroll {
        app.scroll = max_scroll;
    }
    if app.scroll >= max_scroll {
        app.autoscroll = true;
    }

    let title = app
        .selected_session()
        .map(|meta| format!("{} · {}", meta.workspace, meta.title))
        .unwrap_or_else(|| "transcript".to_string());
    let transcript = paragraph.block(panel(&title)).scroll((app.scroll, 0));
    f.render_widget(transcript, area);
}

fn draw_compose(f: &mut Frame, app: &App, area: Rect) {
    let input = Paragraph::new(format!("> {}", app.input))
        .block(panel("compose"))
        .wrap(Wrap { trim: false });
    f.render_widget(input, area);
}

fn draw_status(f: &mut Frame, app: &App, area: Rect) {
    let keys = match app.mode {
        Mode::Normal => "j/k move | a approve | d decline | x dismiss | i compose | m stop | r refresh | q quit",
        Mode::Compose => "Enter send | Esc cancel",
    };
    let line = Line::from(vec![
        Span::styled(
            truncate(&app.status, area.width.saturating_sub(2) as usize / 2),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled(keys, Style::default().fg(Color::DarkGray)),
    ]);
    f.render_widget(Paragraph::new(line), area);
}

fn panel(title: &str) -> Panel<'_> {
    Panel::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .padding(Padding::horizontal(0))
        .title(title)
}
