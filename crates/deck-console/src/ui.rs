use crate::app::{App, InputMode};
use deck_core::wire::TerminalSize;
use deck_core::{Entity, PLACEHOLDER_ID};
use deck_storage::SplitSizes;
use deck_sync::{NoticeLevel, RowView, SessionKind};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap},
    Frame,
};

#[derive(Clone, Copy)]
struct DeckTheme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
    info: Color,
}

fn deck_theme() -> DeckTheme {
    DeckTheme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
        info: Color::Rgb(59, 130, 246),
    }
}

pub struct Panes {
    pub header: Rect,
    pub table: Rect,
    pub output: Rect,
    pub detail: Rect,
    pub status: Rect,
}

fn percent(value: f32) -> u16 {
    value.round().clamp(1.0, 99.0) as u16
}

pub fn panes(area: Rect, splits: &SplitSizes) -> Panes {
    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(area);
    let body = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(percent(splits.vertical[0])),
            Constraint::Percentage(percent(splits.vertical[1])),
        ])
        .split(outer[1]);
    let tools = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(percent(splits.horizontal[0])),
            Constraint::Percentage(percent(splits.horizontal[1])),
        ])
        .split(body[1]);
    Panes {
        header: outer[0],
        table: body[0],
        output: tools[0],
        detail: tools[1],
        status: outer[2],
    }
}

/// Inner size of the output panel, which is what a remote terminal gets.
pub fn terminal_size(area: Rect, splits: &SplitSizes) -> TerminalSize {
    let output = panes(area, splits).output;
    TerminalSize {
        cols: output.width.saturating_sub(2).max(1),
        rows: output.height.saturating_sub(2).max(1),
    }
}

pub fn render(frame: &mut Frame, app: &App) {
    let theme = deck_theme();
    let panes = panes(frame.size(), app.splits());
    frame.render_widget(render_header(app, theme), panes.header);
    render_table(frame, app, theme, panes.table);
    frame.render_widget(render_output(app, theme, panes.output), panes.output);
    frame.render_widget(render_detail(app, theme), panes.detail);
    frame.render_widget(render_status(app, theme), panes.status);
    if let InputMode::Prompt { purpose, buffer } = app.mode() {
        render_prompt(frame, theme, purpose.title(), buffer);
    }
    if app.help_open() {
        render_help_overlay(frame, theme);
    }
}

fn panel<'a>(title: String, theme: DeckTheme, bg: Color) -> Block<'a> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(bg))
        .title(Span::styled(
            title,
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ))
}

fn render_header(app: &App, theme: DeckTheme) -> Paragraph<'static> {
    let view = app.engine().view();
    let roots = view.rows().iter().filter(|row| row.level == 0).count();
    let satellites = view.rows().len() - roots;
    let link = if app.is_connected() {
        Span::styled("online", Style::default().fg(theme.ok))
    } else {
        Span::styled(
            format!("offline ({})", app.last_error().unwrap_or("connecting")),
            Style::default().fg(theme.critical),
        )
    };
    let mut spans = vec![
        Span::styled(
            format!("{} ", app.config().base_url),
            Style::default().fg(theme.text),
        ),
        link,
        Span::styled(
            format!("  Instances: {roots} + {satellites} satellites"),
            Style::default().fg(theme.text),
        ),
    ];
    if let Some(stats) = app.stats() {
        spans.push(Span::styled(
            format!(
                "  CPU {:.0}%  RAM {:.0}%  GPUs {}",
                stats.cpu_percent,
                stats.ram.percent,
                stats.gpus.len()
            ),
            Style::default().fg(theme.muted),
        ));
    }
    let dirty = app.engine().guard().dirty_ids();
    if !dirty.is_empty() {
        spans.push(Span::styled(
            format!("  Unsaved: {}", dirty.len()),
            Style::default().fg(theme.warn),
        ));
    }
    Paragraph::new(Line::from(spans))
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(panel("Deck".to_string(), theme, theme.bg))
}

fn status_color(status: &str, theme: DeckTheme) -> Color {
    match status {
        "started" => theme.ok,
        "starting" | "installing" | "stopping" => theme.warn,
        "error" | "stalled" => theme.critical,
        "stopped" => theme.muted,
        _ => theme.info,
    }
}

fn action_hints(row: &RowView) -> String {
    let mut hints = Vec::new();
    if row.actions.start {
        hints.push("s");
    }
    if row.actions.stop {
        hints.push("x");
    }
    if row.actions.delete {
        hints.push("D");
    }
    if row.actions.view {
        hints.push("o/v");
    }
    hints.join(" ")
}

fn entity_cells(entity: &Entity, level: usize, dirty: bool) -> Vec<String> {
    let name = if level > 0 {
        format!("  └ {}", entity.name)
    } else {
        entity.name.clone()
    };
    let mut flags = String::new();
    if dirty {
        flags.push('*');
    }
    if entity.autostart {
        flags.push('A');
    }
    if entity.persistent_mode {
        flags.push('P');
    }
    vec![
        name,
        entity.status.as_str().to_string(),
        entity
            .display_port()
            .map(|port| port.to_string())
            .unwrap_or_else(|| "-".to_string()),
        entity.gpus.to_csv(),
        entity.blueprint.clone(),
        flags,
    ]
}

fn render_table(frame: &mut Frame, app: &App, theme: DeckTheme, area: Rect) {
    let guard = app.engine().guard();
    let view = app.engine().view();
    let mut rows = Vec::new();

    if let Some(draft) = guard.placeholder() {
        let name = if draft.fields.name.is_empty() {
            "<new instance>".to_string()
        } else {
            draft.fields.name.clone()
        };
        rows.push(
            Row::new(vec![
                Cell::from(format!("+ {name}")),
                Cell::from("draft"),
                Cell::from("-"),
                Cell::from(draft.fields.gpus.to_csv()),
                Cell::from(draft.fields.blueprint.clone()),
                Cell::from(""),
                Cell::from(if draft.can_save() { "Enter save" } else { "" }),
            ])
            .style(Style::default().fg(theme.accent)),
        );
    }

    for row in view.rows() {
        let mut cells: Vec<Cell> = entity_cells(&row.entity, row.level, guard.is_dirty(&row.id))
            .into_iter()
            .map(Cell::from)
            .collect();
        cells[1] = Cell::from(Span::styled(
            row.status.as_str().to_string(),
            Style::default().fg(status_color(row.status.as_str(), theme)),
        ));
        cells.push(Cell::from(action_hints(row)));
        rows.push(Row::new(cells).style(Style::default().fg(theme.text)));
    }

    if view.shows_empty_notice() {
        rows.push(
            Row::new(vec![Cell::from("No instances. Press n to create one.")])
                .style(Style::default().fg(theme.muted)),
        );
    }

    let header = Row::new(vec!["Name", "Status", "Port", "GPUs", "Blueprint", "", "Actions"])
        .style(
            Style::default()
                .fg(theme.muted)
                .add_modifier(Modifier::BOLD),
        );
    let widths = [
        Constraint::Percentage(24),
        Constraint::Length(11),
        Constraint::Length(6),
        Constraint::Length(8),
        Constraint::Percentage(24),
        Constraint::Length(4),
        Constraint::Min(8),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(panel("Instances".to_string(), theme, theme.surface))
        .style(Style::default().bg(theme.surface))
        .highlight_style(
            Style::default()
                .bg(theme.border)
                .add_modifier(Modifier::BOLD),
        );
    let mut state = TableState::default().with_selected(Some(app.selected()));
    frame.render_stateful_widget(table, area, &mut state);
}

fn render_output(app: &App, theme: DeckTheme, area: Rect) -> Paragraph<'static> {
    let Some(kind) = app.tool_view() else {
        return Paragraph::new(Line::from(Span::styled(
            "l logs, t terminal, b build",
            Style::default().fg(theme.muted),
        )))
        .block(panel("Tools".to_string(), theme, theme.bg));
    };
    let title = match app.tool_target(kind) {
        Some(target) => format!("{} · {target}", kind.as_str()),
        None => format!("{} · finished", kind.as_str()),
    };
    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = app
        .output(kind)
        .map(|buffer| buffer.tail(height))
        .unwrap_or_default()
        .into_iter()
        .map(|line| Line::from(line.to_string()))
        .collect();
    let border = if kind == SessionKind::Terminal && *app.mode() == InputMode::Terminal {
        theme.accent
    } else {
        theme.border
    };
    Paragraph::new(Text::from(lines))
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(panel(title, theme, theme.bg).border_style(Style::default().fg(border)))
}

fn render_detail(app: &App, theme: DeckTheme) -> Paragraph<'static> {
    let mut lines = Vec::new();
    let selected = app.selected_id();

    if let InputMode::Edit { id, field } = app.mode() {
        let fields = app.edit_fields(id);
        if let Some(current) = app.current_fields(id) {
            for (idx, name) in fields.iter().enumerate() {
                let marker = if idx == *field { "> " } else { "  " };
                let style = if idx == *field {
                    Style::default().fg(theme.accent).add_modifier(Modifier::BOLD)
                } else {
                    Style::default().fg(theme.text)
                };
                lines.push(Line::from(Span::styled(
                    format!("{marker}{:<14} {}", name.label(), current.value(*name)),
                    style,
                )));
            }
        }
        lines.push(Line::from(Span::styled(
            "Tab next field, Enter save, Esc discard",
            Style::default().fg(theme.muted),
        )));
    } else if let Some(id) = selected.filter(|id| id != PLACEHOLDER_ID) {
        match app.engine().guard().change_set(&id).filter(|change| !change.is_empty()) {
            Some(change) => {
                lines.push(Line::from(Span::styled(
                    "Pending changes",
                    Style::default().fg(theme.warn).add_modifier(Modifier::BOLD),
                )));
                for item in &change.changes {
                    lines.push(Line::from(format!(
                        "{}: {} → {}",
                        item.field.label(),
                        item.old,
                        item.new
                    )));
                }
                if change.requires_restart {
                    lines.push(Line::from(Span::styled(
                        "Saving restarts the instance.",
                        Style::default().fg(theme.warn),
                    )));
                }
            }
            None => {
                if let Some(row) = app.engine().view().row(&id) {
                    lines.extend(entity_lines(&row.entity, theme));
                }
            }
        }
    }

    if let Some(stats) = app.stats() {
        for gpu in &stats.gpus {
            lines.push(Line::from(Span::styled(
                format!(
                    "GPU {} {}: {:.0}% util, {} MiB free",
                    gpu.id,
                    gpu.name,
                    gpu.utilization_percent,
                    gpu.free_vram() / (1024 * 1024)
                ),
                Style::default().fg(theme.muted),
            )));
        }
    }

    Paragraph::new(Text::from(lines))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .wrap(Wrap { trim: true })
        .block(panel("Detail".to_string(), theme, theme.surface))
}

fn entity_lines(entity: &Entity, theme: DeckTheme) -> Vec<Line<'static>> {
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
    vec![
        Line::from(Span::styled(
            entity.name.clone(),
            Style::default().fg(theme.title).add_modifier(Modifier::BOLD),
        )),
        Line::from(format!("id {}  blueprint {}", entity.id, entity.blueprint)),
        Line::from(format!("output {}", optional(&entity.output_path))),
        Line::from(format!(
            "python {}  cuda {}  torch {}",
            optional(&entity.python_version),
            optional(&entity.cuda_version),
            optional(&entity.torch_version)
        )),
        Line::from(format!(
            "autostart {}  persistent {}  hostname {}",
            entity.autostart,
            entity.persistent_mode,
            optional(&entity.hostname)
        )),
    ]
}

fn render_status(app: &App, theme: DeckTheme) -> Paragraph<'static> {
    let line = match app.notice() {
        Some((level, message)) => {
            let color = match level {
                NoticeLevel::Success => theme.ok,
                NoticeLevel::Info => theme.info,
                NoticeLevel::Error => theme.critical,
            };
            Span::styled(message.to_string(), Style::default().fg(color))
        }
        None => Span::styled(
            match app.mode() {
                InputMode::Browse => "? help  q quit",
                InputMode::Edit { .. } => "editing",
                InputMode::Prompt { .. } => "Enter confirm  Esc cancel",
                InputMode::Terminal => "terminal input  Ctrl-] back",
            },
            Style::default().fg(theme.muted),
        ),
    };
    Paragraph::new(Line::from(line)).style(Style::default().bg(theme.bg))
}

fn render_prompt(frame: &mut Frame, theme: DeckTheme, title: &str, buffer: &str) {
    let area = centered_rect(50, 20, frame.size());
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(Line::from(format!("{buffer}_")))
            .style(Style::default().fg(theme.text).bg(theme.surface))
            .block(panel(title.to_string(), theme, theme.surface)),
        area,
    );
}

fn render_help_overlay(frame: &mut Frame, theme: DeckTheme) {
    let area = centered_rect(70, 80, frame.size());
    let keys = [
        ("j/k, arrows", "move selection"),
        ("n", "new instance"),
        ("e", "edit selected row (Tab cycles fields)"),
        ("Enter / Esc", "save / discard pending changes"),
        ("s / x", "start / stop"),
        ("D", "delete to trash (again to overwrite)"),
        ("a", "toggle autostart"),
        ("r", "rebuild environment"),
        ("c / i", "clone / instantiate satellite"),
        ("B", "save as blueprint"),
        ("l / t / b", "logs / terminal / build"),
        ("Tab / w", "switch / close tool session"),
        ("o / v", "open / view link"),
        ("J / K", "move top-level row down / up"),
        ("+ / -", "resize table"),
        ("R", "resync now"),
        ("q", "quit"),
    ];
    let lines: Vec<Line> = keys
        .iter()
        .map(|(key, what)| {
            Line::from(vec![
                Span::styled(
                    format!("{key:<14}"),
                    Style::default().fg(theme.accent).add_modifier(Modifier::BOLD),
                ),
                Span::styled(what.to_string(), Style::default().fg(theme.text)),
            ])
        })
        .collect();
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(Text::from(lines))
            .style(Style::default().bg(theme.surface))
            .block(panel("Help".to_string(), theme, theme.surface)),
        area,
    );
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_tracks_the_output_panel() {
        let area = Rect::new(0, 0, 100, 44);
        let size = terminal_size(area, &SplitSizes::default());
        let output = panes(area, &SplitSizes::default()).output;
        assert_eq!(size.cols, output.width - 2);
        assert_eq!(size.rows, output.height - 2);
        assert!(size.cols < 100 && size.rows < 44);
    }

    #[test]
    fn tiny_area_still_yields_a_usable_size() {
        let size = terminal_size(Rect::new(0, 0, 2, 2), &SplitSizes::default());
        assert_eq!(size, TerminalSize { cols: 1, rows: 1 });
    }
}
