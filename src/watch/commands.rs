//! Typed commands for the sync engine.
//!
//! Commands arrive on a channel fed by the interactive stdin reader or an
//! external dashboard; both speak the same `Command` type.

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Download,
    Upload,
    Check,
    ReloadExtractors,
    Status,
    Quit,
    Help,
}

impl Command {
    /// Parse an interactive command line. Full names and single-character
    /// shortcuts are both accepted.
    pub fn parse(input: &str) -> Option<Command> {
        match input.trim().to_lowercase().as_str() {
            "d" | "download" => Some(Command::Download),
            "u" | "upload" => Some(Command::Upload),
            "c" | "check" => Some(Command::Check),
            "r" | "reload" | "reload-extractors" => Some(Command::ReloadExtractors),
            "s" | "status" => Some(Command::Status),
            "q" | "quit" | "exit" => Some(Command::Quit),
            "h" | "help" | "?" => Some(Command::Help),
            _ => None,
        }
    }
}

pub const HELP_LINES: [&str; 8] = [
    "Available Commands:",
    "  d, download            Download latest flows from the server",
    "  u, upload              Upload local changes to the server",
    "  c, check               Rebuild and upload if the flows changed",
    "  r, reload-extractors   Reload the extractor registry",
    "  s, status              Show sync status",
    "  q, quit                Quit watch mode",
    "  h, help, ?             Show this help",
];

/// Read commands from stdin and forward them into the engine.
/// Exits when stdin closes or the engine side hangs up.
pub fn spawn_stdin_commands(tx: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match Command::parse(trimmed) {
                Some(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                None => warn!("Unknown command: {trimmed}"),
            }
        }
    })
}
