use crate::client::AppSnapshot;
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        self,
        Event,
        KeyCode,
        KeyEventKind,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use itertools::Itertools;
use ratatui::{
    prelude::*,
    widgets::*,
};
use spin_cycle::{
    cycle::Phase,
    history::{
        HistoryRecord,
        TicketStatus,
    },
    ledger::{
        CHIP_CATALOG,
        RANK_LABELS,
        SUIT_LABELS,
        WagerCell,
    },
    outcome::{
        SEGMENT_COUNT,
        cell_for_segment,
    },
    remote::RequestStatus,
};
use std::io::stdout;
use tokio::sync::mpsc;

pub enum UserEvent {
    Quit,
    Redraw,
    SelectChip(u64),
    Place(WagerCell),
    Clear,
    Double,
    Repeat,
    Submit,
    Claim(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Table,
    History,
    CardHistory,
    Account,
}

#[derive(Debug)]
pub struct UiState {
    mode: Mode,
    chip_idx: usize,
    cursor: (usize, usize),
    history_idx: usize,
    ticket_serials: Vec<String>,
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
}

impl Default for UiState {
    fn default() -> Self {
        UiState {
            mode: Mode::Table,
            chip_idx: 0,
            cursor: (0, 0),
            history_idx: 0,
            ticket_serials: Vec::new(),
            terminal: None,
        }
    }
}

pub type InputEventReceiver = mpsc::UnboundedReceiver<Event>;

/// Reads terminal events on a dedicated thread so the async loop never blocks.
pub fn input_event_stream() -> InputEventReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        loop {
            match event::read() {
                Ok(ev) => {
                    if tx.send(ev).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(?err, "terminal input failed");
                    break;
                }
            }
        }
    });
    rx
}

pub async fn next_raw_event(rx: &mut InputEventReceiver) -> Result<Event> {
    rx.recv()
        .await
        .ok_or_else(|| eyre!("terminal input stream closed"))
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn draw(state: &mut UiState, snap: &AppSnapshot) -> Result<()> {
    state.ticket_serials = snap
        .engine
        .records
        .iter()
        .map(|r| r.ticket_serial.clone())
        .collect();
    state.history_idx = state
        .history_idx
        .min(state.ticket_serials.len().saturating_sub(1));
    if let Some(mut term) = state.terminal.take() {
        term.draw(|f| ui(f, state, snap))?;
        state.terminal = Some(term);
    }
    Ok(())
}

pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let k = match event {
        Event::Key(k) => k,
        Event::Resize(..) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    if k.kind != KeyEventKind::Press {
        return None;
    }
    match (state.mode, k.code) {
        (_, KeyCode::Char('q')) => Some(UserEvent::Quit),
        (_, KeyCode::Esc) => {
            state.mode = Mode::Table;
            Some(UserEvent::Redraw)
        }
        (_, KeyCode::Char('h')) => switch_mode(state, Mode::History),
        (_, KeyCode::Char('t')) => switch_mode(state, Mode::CardHistory),
        (_, KeyCode::Char('a')) => switch_mode(state, Mode::Account),
        (Mode::Table, KeyCode::Char(c @ '1'..='7')) => {
            let idx = (c as usize) - ('1' as usize);
            select_chip(state, idx)
        }
        (Mode::Table, KeyCode::Char('[')) => {
            select_chip(state, state.chip_idx.saturating_sub(1))
        }
        (Mode::Table, KeyCode::Char(']')) => {
            select_chip(state, (state.chip_idx + 1).min(CHIP_CATALOG.len() - 1))
        }
        (Mode::Table, KeyCode::Up) => {
            state.cursor.0 = state.cursor.0.saturating_sub(1);
            Some(UserEvent::Redraw)
        }
        (Mode::Table, KeyCode::Down) => {
            state.cursor.0 = (state.cursor.0 + 1).min(RANK_LABELS.len() - 1);
            Some(UserEvent::Redraw)
        }
        (Mode::Table, KeyCode::Left) => {
            state.cursor.1 = state.cursor.1.saturating_sub(1);
            Some(UserEvent::Redraw)
        }
        (Mode::Table, KeyCode::Right) => {
            state.cursor.1 = (state.cursor.1 + 1).min(SUIT_LABELS.len() - 1);
            Some(UserEvent::Redraw)
        }
        (Mode::Table, KeyCode::Enter) => {
            let (row, col) = state.cursor;
            WagerCell::new(row as u8 + 1, col as u8 + 1).map(UserEvent::Place)
        }
        (Mode::Table, KeyCode::Char('c')) => Some(UserEvent::Clear),
        (Mode::Table, KeyCode::Char('d')) => Some(UserEvent::Double),
        (Mode::Table, KeyCode::Char('r')) => Some(UserEvent::Repeat),
        (Mode::Table, KeyCode::Char('s')) => Some(UserEvent::Submit),
        (Mode::History | Mode::CardHistory, KeyCode::Up) => {
            state.history_idx = state.history_idx.saturating_sub(1);
            Some(UserEvent::Redraw)
        }
        (Mode::History | Mode::CardHistory, KeyCode::Down) => {
            let max = state.ticket_serials.len().saturating_sub(1);
            state.history_idx = (state.history_idx + 1).min(max);
            Some(UserEvent::Redraw)
        }
        (Mode::History, KeyCode::Char('x')) => state
            .ticket_serials
            .get(state.history_idx)
            .cloned()
            .map(UserEvent::Claim),
        _ => None,
    }
}

fn switch_mode(state: &mut UiState, mode: Mode) -> Option<UserEvent> {
    state.mode = if state.mode == mode { Mode::Table } else { mode };
    Some(UserEvent::Redraw)
}

fn select_chip(state: &mut UiState, idx: usize) -> Option<UserEvent> {
    let chip = CHIP_CATALOG.get(idx)?;
    state.chip_idx = idx;
    Some(UserEvent::SelectChip(chip.denomination))
}

fn ui(f: &mut Frame, state: &UiState, snap: &AppSnapshot) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(12),
            Constraint::Length(6),
            Constraint::Length(3),
        ])
        .split(f.area());

    draw_header(f, chunks[0], snap);
    match state.mode {
        Mode::Table => {
            let cols = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
                .split(chunks[1]);
            draw_wheel(f, cols[0], snap);
            draw_wager_table(f, cols[1], state, snap);
        }
        Mode::History => draw_history(f, chunks[1], state, snap, true),
        Mode::CardHistory => draw_history(f, chunks[1], state, snap, false),
        Mode::Account => draw_account(f, chunks[1], snap),
    }
    draw_status(f, chunks[2], snap);
    draw_help(f, chunks[3], state.mode);
}

fn draw_header(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let e = &snap.engine;
    let balance = e
        .ledger
        .balance
        .map_or_else(|| "?".to_string(), |b| b.to_string());
    let winning = e
        .profile
        .as_ref()
        .and_then(|p| p.winning_points)
        .map_or_else(|| "-".to_string(), |w| format!("{w:.2}"));
    let offset = e
        .clock_offset
        .map_or_else(|| "local".to_string(), |o| format!("{o:+.1}s"));
    let line = format!(
        "User {} | Points {} | Winning {} | Withdraw time {} | Clock {}",
        snap.user_id, balance, winning, e.cycle_label, offset
    );
    let widget = Paragraph::new(line).block(Block::default().borders(Borders::ALL).title("Spin Cycle"));
    f.render_widget(widget, area);
}

fn phase_style(phase: Phase) -> Style {
    match phase {
        Phase::Open => Style::default().fg(Color::Green),
        Phase::AwaitingOutcome => Style::default().fg(Color::Yellow),
        Phase::Spinning => Style::default()
            .fg(Color::Magenta)
            .add_modifier(Modifier::BOLD),
        Phase::Resolved => Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    }
}

fn draw_wheel(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let e = &snap.engine;
    let block = Block::default().borders(Borders::ALL).title("Wheel");
    let inner = block.inner(area);
    f.render_widget(block, area);
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(2), Constraint::Min(1)])
        .split(inner);

    let ratio = if e.cycle_duration > 0.0 {
        (e.remaining / e.cycle_duration).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let gauge = Gauge::default()
        .block(Block::default().title(format!("{:?}", e.phase)))
        .gauge_style(phase_style(e.phase))
        .ratio(ratio)
        .label(format!("{:.0}s", e.remaining.ceil()));
    f.render_widget(gauge, rows[0]);

    let pointer = cell_for_segment(e.segment_under_pointer);
    let angle = Paragraph::new(format!("Angle {:>6.1}°  ▼ {}", e.angle, pointer));
    f.render_widget(angle, rows[1]);

    let lines: Vec<Line> = (0..SEGMENT_COUNT)
        .map(|i| {
            let label = format!("{:>2} {}", i, cell_for_segment(i));
            if i == e.segment_under_pointer {
                Line::styled(format!("▶ {label}"), phase_style(e.phase))
            } else {
                Line::styled(format!("  {label}"), Style::default().fg(Color::DarkGray))
            }
        })
        .collect();
    f.render_widget(Paragraph::new(lines), rows[2]);
}

fn draw_wager_table(f: &mut Frame, area: Rect, state: &UiState, snap: &AppSnapshot) {
    let ledger = &snap.engine.ledger;
    let rows_area = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(7), Constraint::Length(3), Constraint::Length(3)])
        .split(area);

    let header = Row::new(
        std::iter::once(Cell::from(""))
            .chain(SUIT_LABELS.iter().map(|s| Cell::from(*s)))
            .collect::<Vec<_>>(),
    )
    .style(Style::default().add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = RANK_LABELS
        .iter()
        .enumerate()
        .map(|(r, rank)| {
            let cells = std::iter::once(Cell::from(*rank)).chain((0..SUIT_LABELS.len()).map(|c| {
                let cell = WagerCell::new(r as u8 + 1, c as u8 + 1);
                let amount = cell
                    .and_then(|cell| ledger.placed.iter().find(|(pc, _)| *pc == cell))
                    .map_or(0, |(_, a)| *a);
                let text = if amount > 0 { amount.to_string() } else { "·".to_string() };
                let mut style = Style::default();
                if snap.engine.highlight.is_some() && snap.engine.highlight == cell {
                    style = style.bg(Color::Green).fg(Color::Black);
                }
                if state.cursor == (r, c) {
                    style = style.fg(Color::Yellow).add_modifier(Modifier::BOLD | Modifier::REVERSED);
                }
                Cell::from(text).style(style)
            }));
            Row::new(cells.collect::<Vec<_>>()).height(2)
        })
        .collect();
    let table = Table::new(rows, [Constraint::Ratio(1, 5); 5])
        .header(header)
        .block(Block::default().borders(Borders::ALL).title("Wagers"));
    f.render_widget(table, rows_area[0]);

    let chips = CHIP_CATALOG
        .iter()
        .enumerate()
        .map(|(i, chip)| {
            let text = format!(" {}:{} ", i + 1, chip.denomination);
            if ledger.selection == Some(chip.denomination) {
                Span::styled(text, Style::default().fg(Color::Black).bg(Color::Yellow))
            } else if i == state.chip_idx {
                Span::styled(text, Style::default().fg(Color::Yellow))
            } else {
                Span::raw(text)
            }
        })
        .collect::<Vec<_>>();
    let chips = Paragraph::new(Line::from(chips))
        .block(Block::default().borders(Borders::ALL).title("Chips"));
    f.render_widget(chips, rows_area[1]);

    let summary = format!(
        "Total {} | Last submit: {}{}",
        ledger.total,
        status_text(&ledger.status),
        if ledger.can_repeat { " | r repeats" } else { "" }
    );
    let summary = Paragraph::new(summary).block(Block::default().borders(Borders::ALL));
    f.render_widget(summary, rows_area[2]);
}

fn status_text(status: &RequestStatus) -> String {
    match status {
        RequestStatus::Idle => "none".to_string(),
        RequestStatus::Pending => "pending".to_string(),
        RequestStatus::Submitted { reference } => match reference {
            Some(r) => format!("submitted ({r})"),
            None => "submitted".to_string(),
        },
        RequestStatus::Failed { reason } => format!("failed, not retried: {reason}"),
    }
}

fn fmt_points(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |p| format!("{p:.2}"))
}

fn claim_action(snap: &AppSnapshot, record: &HistoryRecord) -> String {
    let in_flight = snap
        .engine
        .claims
        .iter()
        .find(|(serial, _)| *serial == record.ticket_serial)
        .map(|(_, status)| status);
    match in_flight {
        Some(RequestStatus::Pending) => "Claiming...".to_string(),
        Some(RequestStatus::Submitted { .. }) => "Sent".to_string(),
        Some(RequestStatus::Failed { .. }) => "Failed".to_string(),
        _ if record.is_claimable() => "Claim (x)".to_string(),
        _ => "-".to_string(),
    }
}

fn draw_history(f: &mut Frame, area: Rect, state: &UiState, snap: &AppSnapshot, full: bool) {
    let mut columns = vec!["Card Type", "Ticket Serial", "Bet Amount", "Claim Point", "Unclaim Point"];
    if full {
        columns.extend(["Status", "Action"]);
    }
    let header = Row::new(columns.clone()).style(Style::default().add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = snap
        .engine
        .records
        .iter()
        .map(|r| {
            let mut cells = vec![
                r.card_type.clone().unwrap_or_default(),
                r.ticket_serial.clone(),
                format!("{:.2}", r.bet_amount),
                fmt_points(r.claim_point),
                fmt_points(r.unclaim_point),
            ];
            if full {
                cells.push(r.status().to_string());
                cells.push(claim_action(snap, r));
            }
            let style = match r.status() {
                TicketStatus::Won => Style::default().fg(Color::Green),
                TicketStatus::Lost => Style::default().fg(Color::DarkGray),
                TicketStatus::Pending => Style::default(),
            };
            Row::new(cells).style(style)
        })
        .collect();
    let widths = vec![Constraint::Ratio(1, columns.len() as u32); columns.len()];
    let title = if full { "History" } else { "Card History" };
    let table = Table::new(rows, widths)
        .header(header)
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .block(Block::default().borders(Borders::ALL).title(title));
    let mut table_state = TableState::default();
    if !snap.engine.records.is_empty() {
        table_state.select(Some(state.history_idx));
    }
    f.render_stateful_widget(table, area, &mut table_state);
}

fn draw_account(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let s = &snap.engine.summary;
    let header = Row::new(["Total Sale", "Total Win", "Total Commission", "Net Point"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let row = Row::new([s.total_sale, s.total_win, s.total_commission, s.net_point].map(|v| format!("{v:.2}")));
    let table = Table::new([row], [Constraint::Ratio(1, 4); 4])
        .header(header)
        .block(Block::default().borders(Borders::ALL).title("Account"));
    f.render_widget(table, area);
}

fn draw_status(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let widget = if snap.errors.is_empty() {
        let status = if snap.status.trim().is_empty() {
            "Ready".to_string()
        } else {
            snap.status.clone()
        };
        Paragraph::new(status)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Status"))
            .style(Style::default().fg(Color::Green))
    } else {
        let lines = snap.errors.iter().map(|e| Line::from(e.clone())).collect::<Vec<_>>();
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("Errors | {}", snap.status)),
            )
            .style(Style::default().fg(Color::Red))
    };
    f.render_widget(widget, area);
}

fn draw_help(f: &mut Frame, area: Rect, mode: Mode) {
    let keys: &[&str] = match mode {
        Mode::Table => &[
            "1-7/[ ] chip",
            "arrows cell",
            "Enter place",
            "c clear",
            "d double",
            "r repeat",
            "s submit",
            "h history",
            "t cards",
            "a account",
            "q quit",
        ],
        Mode::History => &["↑/↓ select", "x claim", "Esc back", "q quit"],
        Mode::CardHistory => &["↑/↓ select", "Esc back", "q quit"],
        Mode::Account => &["Esc back", "q quit"],
    };
    let help = Paragraph::new(keys.iter().join(" | "))
        .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, area);
}
