//! Command input from the user.
//!
//! One command per line on stdin, standing in for the preview window's
//! buttons.

use super::UiCommand;
use crate::model::PreviewTarget;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;

pub(crate) const HELP: &str = "commands: combined | indirect | direct | show <preview> | \
exposure <gain> | auto | refresh | save <path> | quit";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub(crate) fn parse_command(line: &str) -> Result<Option<UiCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let cmd = match (word.to_ascii_lowercase().as_str(), rest) {
        ("combined" | "indirect" | "direct", "") => UiCommand::Show(word.parse()?),
        ("show", target) => UiCommand::Show(target.parse::<PreviewTarget>()?),
        ("exposure" | "gain", value) => {
            let gain = value
                .parse::<i32>()
                .map_err(|_| format!("exposure needs an integer gain, got '{value}'"))?;
            UiCommand::Exposure(gain)
        }
        ("auto", "") => UiCommand::AutoExposure,
        ("refresh" | "r", "") => UiCommand::Refresh,
        ("save", "") => return Err("save needs a destination path".into()),
        ("save", path) => UiCommand::SaveAs(PathBuf::from(path)),
        ("quit" | "q" | "exit", "") => UiCommand::Quit,
        _ => return Err(format!("unknown command '{line}'; {HELP}")),
    };
    Ok(Some(cmd))
}

/// Forward parsed stdin commands to the controller.
///
/// On EOF the session is asked to quit unless it is meant to end by itself
/// once the render is done.
pub(crate) fn spawn_stdin_reader(
    cmd_tx: UnboundedSender<UiCommand>,
    quit_on_eof: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(Some(cmd)) => {
                        if cmd_tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => tracing::warn!("{msg}"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read commands from stdin");
                    break;
                }
            }
        }
        if quit_on_eof {
            let _ = cmd_tx.send(UiCommand::Quit);
        }
    })
}
