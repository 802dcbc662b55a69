//! Stdin console: typed queries and a few slash commands.

use duplex_voice::EngineHandle;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Query(String),
    Wake,
    Status,
    Quit,
    Empty,
}

pub fn parse_line(line: &str) -> ConsoleInput {
    match line.trim() {
        "" => ConsoleInput::Empty,
        "/wake" => ConsoleInput::Wake,
        "/status" => ConsoleInput::Status,
        "/quit" | "/exit" => ConsoleInput::Quit,
        text => ConsoleInput::Query(text.to_string()),
    }
}

/// Read stdin until EOF or `/quit`. Returns true when the user asked to quit.
pub async fn run(handle: EngineHandle) -> bool {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Console read failed");
                return false;
            }
        };

        let sent = match parse_line(&line) {
            ConsoleInput::Empty => Ok(()),
            ConsoleInput::Status => {
                info!(state = ?handle.state(), "Engine state");
                Ok(())
            }
            ConsoleInput::Wake => handle.wake().await,
            ConsoleInput::Quit => return true,
            ConsoleInput::Query(text) => handle.submit_text(text).await,
        };
        if let Err(e) = sent {
            warn!(error = %e, "Console command not delivered");
        }
    }
}
