use std::error::Error;
use std::io::stdout;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction as LayoutDirection, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};

use crate::control::api::{self, CblkStatus};
use crate::lifecycle::TrackState;
use crate::packed::CblkFlags;
use crate::region::TrackRegion;

const TICK_RATE: Duration = Duration::from_millis(100);

/// What the console may do to the channel it watches.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Observe only. Action keys are refused.
    #[default]
    ReadOnly,
    /// Action keys may change flags, volume or condemn the channel.
    Control,
}

#[derive(Default)]
struct AppState {
    access: Access,
    status: Option<CblkStatus>,
    mode: Mode,
    message: Option<String>,
    last_update: Option<Instant>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    VolumeInput,
    ConfirmInvalidate,
}

struct VolumeEditor {
    buffer: String,
}

/// Run the console against the region mapped at `path`.
pub fn run(path: impl AsRef<Path>, access: Access) -> Result<(), Box<dyn Error>> {
    let region = Arc::new(api::open(path)?);

    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    let poller = Arc::clone(&region);
    std::thread::spawn(move || {
        loop {
            if status_tx.send(api::status(&poller)).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState {
        access,
        ..AppState::default()
    };
    let mut volume_editor: Option<VolumeEditor> = None;

    loop {
        terminal.draw(|frame| draw(frame, &app, volume_editor.as_ref()))?;

        if let Some(status) = try_recv_latest(&status_rx) {
            app.status = Some(status);
            app.last_update = Some(Instant::now());
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&mut app, &region, &mut volume_editor, key) {
                    break;
                }
            }
        }
    }

    restore_terminal()?;
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn handle_key(
    app: &mut AppState,
    region: &TrackRegion,
    volume_editor: &mut Option<VolumeEditor>,
    key: KeyEvent,
) -> bool {
    match app.mode {
        Mode::Normal => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Char('f' | 'u' | 'r' | 'i' | 'v') if app.access == Access::ReadOnly => {
                app.message = Some("Read-only console; relaunch with --control".to_string());
            }
            KeyCode::Char('f') => {
                let enabled = api::toggle_force_ready(region);
                app.message = Some(format!(
                    "Force-ready {}",
                    if enabled { "set" } else { "cleared" }
                ));
            }
            KeyCode::Char('u') => {
                api::clear_underrun(region);
                app.message = Some("Underrun cleared".to_string());
            }
            KeyCode::Char('r') => {
                app.message = Some(match api::restart(region) {
                    Ok(()) => "Channel restarted".to_string(),
                    Err(err) => format!("Restart failed: {err}"),
                });
            }
            KeyCode::Char('i') => app.mode = Mode::ConfirmInvalidate,
            KeyCode::Char('v') => {
                let current = app
                    .status
                    .as_ref()
                    .map(|s| format!("{:.3} {:.3}", s.volume.left_gain(), s.volume.right_gain()))
                    .unwrap_or_default();
                volume_editor.replace(VolumeEditor { buffer: current });
                app.mode = Mode::VolumeInput;
            }
            _ => {}
        },
        Mode::ConfirmInvalidate => {
            if key.code == KeyCode::Char('y') {
                api::invalidate(region);
                app.message = Some("Channel invalidated".to_string());
            }
            app.mode = Mode::Normal;
        }
        Mode::VolumeInput => match key.code {
            KeyCode::Esc => {
                volume_editor.take();
                app.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                if let Some(editor) = volume_editor.take() {
                    match parse_volume(&editor.buffer) {
                        Some((left, right)) => {
                            api::set_volume(region, left, right);
                            app.message = Some(format!("Volume set to {left:.3} / {right:.3}"));
                        }
                        None => app.message = Some("Expected `gain` or `left right`".to_string()),
                    }
                }
                app.mode = Mode::Normal;
            }
            KeyCode::Backspace => {
                if let Some(editor) = volume_editor.as_mut() {
                    editor.buffer.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(editor) = volume_editor.as_mut() {
                    if c.is_ascii_digit() || matches!(c, '.' | ' ') {
                        editor.buffer.push(c);
                    }
                }
            }
            _ => {}
        },
    }
    false
}

fn parse_volume(input: &str) -> Option<(f32, f32)> {
    let mut parts = input.split_whitespace().map(str::parse::<f32>);
    let left = parts.next()?.ok()?;
    let right = match parts.next() {
        Some(value) => value.ok()?,
        None => left,
    };
    parts.next().is_none().then_some((left, right))
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState, volume_editor: Option<&VolumeEditor>) {
    let chunks = Layout::default()
        .direction(LayoutDirection::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Min(6),
            Constraint::Length(4),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_counters(frame, chunks[1], app);
    draw_fields(frame, chunks[2], app);
    draw_footer(frame, chunks[3], app);

    if let Some(editor) = volume_editor {
        let area = Layout::default()
            .direction(LayoutDirection::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(frame.size())[1];

        let block = Block::default()
            .title("Volume (left right): Enter to apply, Esc to cancel")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow));

        let paragraph = Paragraph::new(editor.buffer.clone())
            .block(block)
            .wrap(Wrap { trim: false });

        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }
}

fn state_style(state: TrackState) -> Style {
    let color = match state {
        TrackState::Active => Color::Green,
        TrackState::Constructed => Color::Cyan,
        TrackState::Underrun | TrackState::Restoring => Color::Yellow,
        TrackState::Disabled | TrackState::Invalid => Color::Red,
    };
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default()
        .title("Control Block Console")
        .borders(Borders::ALL);

    let content = if let Some(status) = &app.status {
        Paragraph::new(Line::from(vec![
            Span::styled(format!("{:?}", status.state), state_style(status.state)),
            Span::raw(format!(
                "    Track {}    {:?}    {} Hz    {} frames x {} bytes    {}",
                status.name,
                status.direction,
                status.sample_rate,
                status.frame_count,
                status.frame_size,
                if status.inline_buffers { "inline" } else { "external" },
            )),
        ]))
    } else {
        Paragraph::new(Line::from(vec![Span::styled(
            "Waiting for first snapshot",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    };

    frame.render_widget(content.block(block), area);
}

fn draw_counters(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Positions").borders(Borders::ALL);

    let Some(status) = &app.status else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let header = Row::new(vec![
        Cell::from("Side"),
        Cell::from("Counter"),
        Cell::from("Base"),
        Cell::from("Offset"),
        Cell::from("Laps"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let p = &status.positions;
    let rows = [
        ("client", p.user, p.user_base, status.user_offset, p.user_laps),
        ("server", p.server, p.server_base, status.server_offset, p.server_laps),
    ]
    .into_iter()
    .map(|(side, counter, base, offset, laps)| {
        Row::new(vec![
            Cell::from(side),
            Cell::from(format!("{counter}")),
            Cell::from(format!("{base}")),
            Cell::from(format!("{offset}")),
            Cell::from(format!("{laps}")),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(8),
            Constraint::Length(12),
            Constraint::Length(12),
            Constraint::Length(8),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_fields(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Status").borders(Borders::ALL);

    let Some(status) = &app.status else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let fill = match (status.filled, status.fill_ratio()) {
        (Some(filled), Some(ratio)) => {
            Span::raw(format!("{filled} frames ({:.1}%)", ratio * 100.0))
        }
        _ => Span::styled("inconsistent", Style::default().fg(Color::Red)),
    };
    let looping = if status.loop_state.count == 0 {
        "off".to_string()
    } else {
        format!(
            "{}..{} x{}",
            status.loop_state.start, status.loop_state.end, status.loop_state.count
        )
    };
    let flags: Vec<&str> = status.flags.iter_names().map(|(name, _)| name).collect();

    let lines = vec![
        Line::from(vec![Span::raw("Fill        : "), fill]),
        Line::from(format!("Loop        : {looping}")),
        Line::from(format!(
            "Volume      : L {:.3}  R {:.3}    Send {:.3}",
            status.volume.left_gain(),
            status.volume.right_gain(),
            status.send_level
        )),
        Line::from(format!(
            "Stall       : {} / {} ms",
            status.wait_time_ms, status.buffer_timeout_ms
        )),
        Line::from(format!(
            "Flags       : {:#04x} [{}]",
            status.flags.bits(),
            flags.join(" | ")
        )),
        Line::from(format!(
            "Lock        : {}    notify seq {}",
            if status.locked { "held" } else { "free" },
            status.notify_sequence
        )),
    ];

    let style = if status.flags.contains(CblkFlags::INVALID) {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    };
    frame.render_widget(Paragraph::new(lines).style(style).block(block), area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = match (app.mode, app.access) {
        (Mode::ConfirmInvalidate, _) => {
            "Invalidate this channel? y: confirm  any other key: cancel"
        }
        (_, Access::ReadOnly) => "Read-only  •  q: Quit",
        (_, Access::Control) => {
            "f: Force-ready  •  u: Clear underrun  •  r: Restart  •  v: Volume  •  i: Invalidate  •  q: Quit"
        }
    };
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
