//! Live terminal view over the outcome stream

use crate::proxy::aggregator::{Aggregator, Verdict};
use crate::proxy::classifier::FailureClass;
use crate::proxy::models::ProbeOutcome;
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Duration;
use tracing::info;

/// Outcomes kept per list for display
const MAX_RECENT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Valid,
    Failed,
}

/// Feeds the aggregator while drawing progress, recent outcomes and the
/// running failure breakdown
pub struct ProbeMonitor {
    aggregator: Aggregator,
    recent_valid: VecDeque<ProbeOutcome>,
    recent_failed: VecDeque<(ProbeOutcome, FailureClass)>,
    selected: Pane,
    list_state: ListState,
    status_message: String,
    is_complete: bool,
    should_quit: bool,
}

impl ProbeMonitor {
    pub fn new(aggregator: Aggregator) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            aggregator,
            recent_valid: VecDeque::new(),
            recent_failed: VecDeque::new(),
            selected: Pane::Valid,
            list_state,
            status_message: "Probing... Press 'q' to leave the view.".to_string(),
            is_complete: false,
            should_quit: false,
        }
    }

    /// Show the view until the user quits, then hand back the aggregator.
    ///
    /// Outcomes still in flight when the view closes are recorded with
    /// plain logging, so the aggregate is always complete.
    pub async fn run(mut self, mut outcomes: mpsc::Receiver<ProbeOutcome>) -> Result<Aggregator> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal, &mut outcomes).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;
        result?;

        if !self.is_complete {
            info!("live view closed, waiting for remaining probes");
            while let Some(outcome) = outcomes.recv().await {
                self.aggregator.observe(outcome);
            }
        }

        Ok(self.aggregator)
    }

    async fn run_app<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        outcomes: &mut mpsc::Receiver<ProbeOutcome>,
    ) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            if !self.is_complete {
                self.drain_ready(outcomes);
            } else {
                tokio::task::yield_now().await;
            }
        }

        Ok(())
    }

    /// Take everything already queued without waiting
    fn drain_ready(&mut self, outcomes: &mut mpsc::Receiver<ProbeOutcome>) {
        loop {
            match outcomes.try_recv() {
                Ok(outcome) => self.record(outcome),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.is_complete = true;
                    break;
                }
            }
        }
        self.status_message = self.status_line();
    }

    fn record(&mut self, outcome: ProbeOutcome) {
        match self.aggregator.observe(outcome.clone()) {
            Verdict::Valid => push_recent(&mut self.recent_valid, outcome),
            Verdict::Slow => {}
            Verdict::Failed(class) => push_recent(&mut self.recent_failed, (outcome, class)),
        }
    }

    fn status_line(&self) -> String {
        let counts = format!(
            "Checked: {} | Usable: {} | Slow: {} | Failed: {}",
            self.aggregator.checked(),
            self.aggregator.valid_count(),
            self.aggregator.slow_count(),
            self.aggregator.failure_count()
        );
        if self.is_complete {
            format!("Complete! {} | Press 'q' to continue", counts)
        } else {
            format!("Probing... {}", counts)
        }
    }

    fn selected_len(&self) -> usize {
        match self.selected {
            Pane::Valid => self.recent_valid.len(),
            Pane::Failed => self.recent_failed.len(),
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Tab => {
                self.selected = match self.selected {
                    Pane::Valid => Pane::Failed,
                    Pane::Failed => Pane::Valid,
                };
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < len => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3),
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(3),
            ])
            .split(f.size());

        let title = Paragraph::new("Proxy Sieve")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let checked = self.aggregator.checked();
        let usable = self.aggregator.valid_count();
        let percent = if checked > 0 {
            (usable as f64 / checked as f64 * 100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Usable"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(percent.min(100))
            .label(format!("{}/{} ({}%)", usable, checked, percent));
        f.render_widget(gauge, chunks[1]);

        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(40),
                Constraint::Percentage(40),
                Constraint::Percentage(20),
            ])
            .split(chunks[2]);

        let valid_items: Vec<ListItem> = self
            .recent_valid
            .iter()
            .rev()
            .map(|o| {
                ListItem::new(format!(
                    "{} ({:.0}ms, {:.2}MB/s)",
                    o.url, o.latency_ms, o.download_speed_mbps
                ))
                .style(Style::default().fg(Color::Green))
            })
            .collect();
        let failed_items: Vec<ListItem> = self
            .recent_failed
            .iter()
            .rev()
            .map(|(o, class)| {
                ListItem::new(format!("{} [{}]", o.url, class))
                    .style(Style::default().fg(Color::Red))
            })
            .collect();

        let selected = self.selected;
        Self::render_list(
            f,
            columns[0],
            format!("Usable ({})", usable),
            valid_items,
            (selected == Pane::Valid).then_some(&mut self.list_state),
        );
        Self::render_list(
            f,
            columns[1],
            format!("Failed ({})", self.aggregator.failure_count()),
            failed_items,
            (selected == Pane::Failed).then_some(&mut self.list_state),
        );

        let categories: Vec<ListItem> = self
            .aggregator
            .failure_breakdown()
            .into_iter()
            .map(|(class, count)| ListItem::new(format!("{}: {}", class, count)))
            .collect();
        let categories =
            List::new(categories).block(Block::default().borders(Borders::ALL).title("Categories"));
        f.render_widget(categories, columns[2]);

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }

    fn render_list(
        f: &mut Frame,
        area: Rect,
        title: String,
        items: Vec<ListItem>,
        list_state: Option<&mut ListState>,
    ) {
        let border_style = if list_state.is_some() {
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(border_style),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");

        match list_state {
            Some(state) => f.render_stateful_widget(list, area, state),
            None => f.render_widget(list, area),
        }
    }
}

fn push_recent<T>(recent: &mut VecDeque<T>, item: T) {
    recent.push_back(item);
    if recent.len() > MAX_RECENT {
        recent.pop_front();
    }
}
