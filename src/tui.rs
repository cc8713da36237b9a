use std::io;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};

use crate::preload::PreloadHandle;
use crate::progress::{PreloadState, PreloadStatus};

const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableExit {
    Finished,
    Detached,
}

#[derive(Debug, Clone, PartialEq)]
struct RowModel {
    data_id: String,
    status: Option<PreloadStatus>,
    progress: f64,
    message: String,
}

/// Live table of preload progress, one row per data id.
pub struct ProgressTable {
    data_ids: Vec<String>,
    started: Instant,
}

/// Leaves raw mode and the alternate screen however the loop exits.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> miette::Result<Self> {
        enable_raw_mode().into_diagnostic()?;
        io::stdout().execute(EnterAlternateScreen).into_diagnostic()?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().execute(LeaveAlternateScreen);
    }
}

impl ProgressTable {
    pub fn new(data_ids: &[String]) -> Self {
        Self {
            data_ids: data_ids.to_vec(),
            started: Instant::now(),
        }
    }

    /// Redraws until every data id reached a final state. `q` or `Esc`
    /// leaves the view while the preload keeps running.
    pub fn run(&mut self, handle: &PreloadHandle) -> miette::Result<TableExit> {
        let _guard = TerminalGuard::enter()?;
        let backend = CrosstermBackend::new(io::stdout());
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let mut tick = 0usize;
        loop {
            let rows = rows(&self.data_ids, &handle.states());
            let elapsed = self.started.elapsed();
            terminal
                .draw(|frame| draw_table(frame, &rows, elapsed, tick))
                .into_diagnostic()?;

            let done = rows
                .iter()
                .all(|row| row.status.map(PreloadStatus::is_terminal).unwrap_or(false));
            if done || handle.is_finished() {
                return Ok(TableExit::Finished);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if key.kind == KeyEventKind::Press
                        && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                    {
                        return Ok(TableExit::Detached);
                    }
                }
            }
            tick = tick.wrapping_add(1);
        }
    }
}

fn rows(data_ids: &[String], states: &[PreloadState]) -> Vec<RowModel> {
    data_ids
        .iter()
        .map(|data_id| match states.iter().find(|s| &s.data_id == data_id) {
            Some(state) => RowModel {
                data_id: data_id.clone(),
                status: Some(state.status),
                progress: state.progress,
                message: state.message.clone(),
            },
            None => RowModel {
                data_id: data_id.clone(),
                status: None,
                progress: 0.0,
                message: "Waiting".to_string(),
            },
        })
        .collect()
}

fn draw_table(frame: &mut ratatui::Frame, rows: &[RowModel], elapsed: Duration, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(4),
            Constraint::Length(1),
        ])
        .split(frame.area());

    let spinner = ['|', '/', '-', '\\'][tick % 4];
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            "icosdp preload ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("{spinner} {}s", elapsed.as_secs())),
    ]))
    .block(Block::default().borders(Borders::ALL));
    frame.render_widget(header, chunks[0]);

    let table_rows = rows.iter().map(|row| {
        let (label, style) = status_label(row.status);
        Row::new(vec![
            Cell::from(row.data_id.clone()),
            Cell::from(Span::styled(label, style)),
            Cell::from(progress_bar(row.progress)),
            Cell::from(row.message.clone()),
        ])
    });
    let table = Table::new(
        table_rows,
        [
            Constraint::Length(22),
            Constraint::Length(10),
            Constraint::Length(BAR_WIDTH as u16 + 8),
            Constraint::Min(20),
        ],
    )
    .header(
        Row::new(vec!["Data ID", "Status", "Progress", "Message"])
            .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title("Preload"));
    frame.render_widget(table, chunks[1]);

    let footer = Paragraph::new(Span::styled(
        "q / Esc: detach (preload continues)",
        Style::default().fg(Color::DarkGray),
    ));
    frame.render_widget(footer, chunks[2]);
}

fn status_label(status: Option<PreloadStatus>) -> (String, Style) {
    match status {
        None => ("pending".to_string(), Style::default().fg(Color::DarkGray)),
        Some(PreloadStatus::Started) => ("started".to_string(), Style::default().fg(Color::Yellow)),
        Some(PreloadStatus::Running) => ("running".to_string(), Style::default().fg(Color::Yellow)),
        Some(PreloadStatus::Finished) => ("finished".to_string(), Style::default().fg(Color::Green)),
        Some(PreloadStatus::Failed) => ("failed".to_string(), Style::default().fg(Color::Red)),
    }
}

fn progress_bar(progress: f64) -> String {
    let progress = progress.clamp(0.0, 1.0);
    let filled = (progress * BAR_WIDTH as f64).round() as usize;
    let mut out = String::from("[");
    for i in 0..BAR_WIDTH {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out.push_str(&format!(" {:>3}%", (progress * 100.0).round() as u32));
    out
}
