use crate::shell::Link;
use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, pad: usize, desc: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(desc),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let mut lines = vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (stops the worker)"),
        ]),
        key_line("s", 11, "Start / stop the worker"),
        key_line("r", 11, "Restart the worker"),
        key_line("o", 11, "Open the worker's logs folder"),
        key_line("tab", 9, "Switch tabs"),
        key_line("1-5", 9, "Jump to tab"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Logs tab:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
            Span::raw(" or "),
            Span::styled("j/k", Style::default().fg(Color::Magenta)),
            Span::raw("  Scroll"),
        ]),
        key_line("PgUp/PgDn", 3, "Scroll a page"),
        key_line("G", 11, "Follow new output"),
        key_line("f", 11, "Cycle log source (direct output, bridge/trace files)"),
        key_line("a", 11, "Toggle auto-scroll"),
        key_line("c", 11, "Clear display"),
        Line::from(""),
        Line::from("Models tab:"),
        key_line("m", 11, "Reload models.json"),
        Line::from(""),
        Line::from("Config tab:"),
        key_line("↑/↓", 9, "Select setting"),
        key_line("Enter", 7, "Edit setting (Enter to apply, Esc to cancel)"),
        key_line("tab", 9, "New line while editing a model list"),
        key_line("w", 11, "Write bridgeData.yaml"),
        key_line("R", 11, "Reload bridgeData.yaml from disk"),
        Line::from(""),
        Line::from("Missing packages prompt (--check-deps true):"),
        key_line("y / n", 7, "Install with pip and start / skip"),
        Line::from(""),
        Line::from("Links (press the key on this page):"),
    ];
    for link in Link::ALL {
        lines.push(Line::from(vec![
            Span::raw("  "),
            Span::styled(link.key().to_string(), Style::default().fg(Color::Magenta)),
            Span::raw(format!("{:11}{:<20}", "", link.label())),
            Span::styled(link.url(), Style::default().fg(Color::Cyan)),
        ]));
    }
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
