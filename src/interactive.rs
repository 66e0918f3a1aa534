//! Interactive terminal UI for unsubscribe runs
//!
//! Sender selection happens up front through a checkbox list; the manual
//! link and block-offer steps capture single keystrokes in raw mode.

use crate::error::{Result, UnsubscribeError};
use crate::models::{SelectionSet, Sender};
use crate::workflow::{BlockGate, LinkGate, WorkflowOptions, WorkflowUi};
use async_trait::async_trait;
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{self, ClearType},
};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One row of the sender picker
struct SenderRow {
    email: String,
    name: String,
    message_count: u64,
}

impl SenderRow {
    fn new(sender: &Sender) -> Self {
        Self {
            email: sender.email.clone(),
            name: sender.display_name().to_string(),
            message_count: sender.message_count,
        }
    }
}

impl fmt::Display for SenderRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.email {
            write!(
                f,
                "{:<44} {:>5} msgs",
                truncate_str(&self.email, 44),
                self.message_count
            )
        } else {
            write!(
                f,
                "{:<44} {:>5} msgs  {}",
                truncate_str(&self.email, 44),
                self.message_count,
                truncate_str(&self.name, 28)
            )
        }
    }
}

/// Checkbox list over the aggregated senders, keeping table order.
///
/// Esc leaves the selection empty rather than failing the command.
pub fn select_senders(senders: &[Sender]) -> Result<SelectionSet> {
    let mut selection = SelectionSet::new();
    if senders.is_empty() {
        return Ok(selection);
    }

    let rows: Vec<SenderRow> = senders.iter().map(SenderRow::new).collect();

    let picked = match inquire::MultiSelect::new("Senders to unsubscribe from:", rows)
        .with_page_size(15)
        .with_help_message("space toggles, enter starts the run, esc aborts")
        .prompt()
    {
        Ok(picked) => picked,
        Err(inquire::InquireError::OperationCanceled)
        | Err(inquire::InquireError::OperationInterrupted) => {
            debug!("Sender selection cancelled");
            return Ok(selection);
        }
        Err(e) => {
            return Err(UnsubscribeError::Unknown(format!(
                "Sender selection failed: {}",
                e
            )))
        }
    };

    for row in picked {
        selection.insert(row.email, row.message_count);
    }

    Ok(selection)
}

/// Confirm the follow-up actions for this run, seeded from the config
/// defaults. Esc aborts the whole command.
pub fn prompt_run_options(defaults: WorkflowOptions) -> Result<WorkflowOptions> {
    let delete_after = confirm(
        "Move all messages from the selected senders to Trash afterwards?",
        defaults.delete_after,
    )?;
    let block_after = confirm(
        "Also create block filters for the selected senders?",
        defaults.block_after,
    )?;

    Ok(WorkflowOptions {
        delete_after,
        block_after,
    })
}

fn confirm(message: &str, default: bool) -> Result<bool> {
    match inquire::Confirm::new(message).with_default(default).prompt() {
        Ok(answer) => Ok(answer),
        Err(inquire::InquireError::OperationCanceled)
        | Err(inquire::InquireError::OperationInterrupted) => Err(UnsubscribeError::Cancelled(
            "run options prompt".to_string(),
        )),
        Err(e) => Err(UnsubscribeError::Unknown(format!("Prompt failed: {}", e))),
    }
}

/// Terminal implementation of the workflow's presentation seam.
///
/// Holds shared handles back into the CLI loop: the live selection set,
/// cleared after a successful run, and a refresh flag the loop reads to
/// decide whether to re-scan the inbox.
pub struct TerminalUi {
    selection: Arc<Mutex<SelectionSet>>,
    refresh_requested: Arc<AtomicBool>,
}

impl TerminalUi {
    pub fn new(selection: Arc<Mutex<SelectionSet>>, refresh_requested: Arc<AtomicBool>) -> Self {
        Self {
            selection,
            refresh_requested,
        }
    }
}

#[async_trait]
impl WorkflowUi for TerminalUi {
    async fn open_link(&self, url: &str) {
        // The gate card repeats the link, so the user can still act when
        // no browser could be launched
        if let Err(e) = opener::open(url) {
            warn!("Could not open a browser for {}: {}", url, e);
        }
    }

    async fn wait_link_gate(
        &self,
        position: usize,
        total: usize,
        sender: &str,
        url: &str,
    ) -> LinkGate {
        match with_raw_mode(|| link_gate_screen(position, total, sender, url)) {
            Ok(gate) => gate,
            Err(e) => {
                warn!("Terminal failure during the link step: {}", e);
                LinkGate::Cancel
            }
        }
    }

    async fn wait_block_gate(&self, position: usize, total: usize, sender: &str) -> BlockGate {
        match with_raw_mode(|| block_gate_screen(position, total, sender)) {
            Ok(gate) => gate,
            Err(e) => {
                warn!("Terminal failure during the block step: {}", e);
                BlockGate::Cancel
            }
        }
    }

    async fn clear_selection(&self) {
        self.selection.lock().await.clear();
        debug!("Selection cleared after successful run");
    }

    async fn request_refresh(&self) {
        self.refresh_requested.store(true, Ordering::SeqCst);
    }
}

/// Run `f` with the terminal in raw mode, restoring it afterwards even
/// when the closure fails
fn with_raw_mode<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    terminal::enable_raw_mode()
        .map_err(|e| UnsubscribeError::Unknown(format!("Failed to enable raw mode: {}", e)))?;
    let _ = execute!(io::stdout(), cursor::Hide);

    let result = f();

    // Always restore the terminal
    let _ = terminal::disable_raw_mode();
    let _ = execute!(io::stdout(), cursor::Show);

    result
}

fn link_gate_screen(position: usize, total: usize, sender: &str, url: &str) -> Result<LinkGate> {
    let mut stdout = io::stdout();
    let w = get_display_width();

    let rows = vec![
        format!("Sender: {}", truncate_str(sender, w.saturating_sub(10))),
        format!("Link:   {}", truncate_str(url, w.saturating_sub(10))),
        String::new(),
        "The unsubscribe page should be open in your browser.".to_string(),
        "Finish it there, then continue to the next sender.".to_string(),
    ];

    draw_card(
        &mut stdout,
        w,
        &format!("MANUAL UNSUBSCRIBE  {}", step_counter(position, total)),
        &rows,
        "[Enter] Continue  [Q] Cancel run",
    )?;

    loop {
        let key = read_key()?;
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Ok(LinkGate::Cancel);
        }
        match key.code {
            KeyCode::Enter | KeyCode::Char('y') | KeyCode::Char('Y') => {
                return Ok(LinkGate::Continue)
            }
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(LinkGate::Cancel),
            _ => continue,
        }
    }
}

fn block_gate_screen(position: usize, total: usize, sender: &str) -> Result<BlockGate> {
    let mut stdout = io::stdout();
    let w = get_display_width();

    let rows = vec![
        "No automatic unsubscribe method worked for:".to_string(),
        format!("  {}", truncate_str(sender, w.saturating_sub(4))),
        String::new(),
        "Blocking creates a Gmail filter that deletes future mail".to_string(),
        "from this address.".to_string(),
    ];

    draw_card(
        &mut stdout,
        w,
        &format!("BLOCK SENDER  {}", step_counter(position, total)),
        &rows,
        "[Y] Block  [S] Skip  [Q] Cancel run",
    )?;

    loop {
        let key = read_key()?;
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Ok(BlockGate::Cancel);
        }
        match key.code {
            KeyCode::Enter
            | KeyCode::Char('y')
            | KeyCode::Char('Y')
            | KeyCode::Char('b')
            | KeyCode::Char('B') => return Ok(BlockGate::Block),
            KeyCode::Char('s') | KeyCode::Char('S') | KeyCode::Char('n') | KeyCode::Char('N') => {
                return Ok(BlockGate::Skip)
            }
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(BlockGate::Cancel),
            _ => continue,
        }
    }
}

/// Wait for the next key press.
/// Only Press events count; Windows also delivers Repeat and Release
/// for a single keystroke.
fn read_key() -> Result<KeyEvent> {
    loop {
        if let Event::Key(key) =
            event::read().map_err(|e| UnsubscribeError::Unknown(format!("Input error: {}", e)))?
        {
            if key.kind == KeyEventKind::Press {
                return Ok(key);
            }
        }
    }
}

fn draw_card(
    stdout: &mut io::Stdout,
    w: usize,
    title: &str,
    rows: &[String],
    keys: &str,
) -> Result<()> {
    execute!(stdout, terminal::Clear(ClearType::All), cursor::MoveTo(0, 0))
        .map_err(|e| UnsubscribeError::Unknown(format!("Terminal error: {}", e)))?;

    // Raw mode needs \r\n, not just \n
    macro_rules! out {
        ($($arg:tt)*) => {
            write!(stdout, "{}\r\n", format!($($arg)*))
                .map_err(|e| UnsubscribeError::Unknown(e.to_string()))?
        };
    }

    let line = |content: &str| -> String {
        let chars: Vec<char> = content.chars().collect();
        let len = chars.len();
        if len >= w {
            format!("│ {} │", chars.iter().take(w).collect::<String>())
        } else {
            format!("│ {}{} │", content, " ".repeat(w - len))
        }
    };

    out!("┌{}┐", "─".repeat(w + 2));
    out!("{}", line(title));
    out!("├{}┤", "─".repeat(w + 2));
    for row in rows {
        out!("{}", line(row));
    }
    out!("├{}┤", "─".repeat(w + 2));
    out!("{}", line(keys));
    out!("└{}┘", "─".repeat(w + 2));

    stdout
        .flush()
        .map_err(|e| UnsubscribeError::Unknown(e.to_string()))
}

/// Inner content width for the gate cards, based on terminal size
/// (excluding borders)
fn get_display_width() -> usize {
    let term_width = terminal::size()
        .map(|(cols, _)| cols as usize)
        .unwrap_or(120);

    // Content width = terminal width - 4 (for "│ " and " │" borders)
    let content_width = term_width.saturating_sub(4);
    content_width.clamp(60, 120)
}

/// Truncate a string to fit within max_len characters (UTF-8 safe)
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!(
            "{}...",
            s.chars()
                .take(max_len.saturating_sub(3))
                .collect::<String>()
        )
    }
}

/// 1-based step counter for the gate card titles. The workflow hands the
/// screens a 0-based cursor position.
fn step_counter(position: usize, total: usize) -> String {
    format!("{}/{}", position + 1, total)
}
