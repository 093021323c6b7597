//! Classification of client-local pseudo-commands.
//!
//! A small set of commands is handled by the relay itself and never
//! reaches the shell process: `clear`, `help`, and `history`. They are
//! recognized only when the input is a single complete line; embedded in
//! a larger write (pasted scripts, partial lines) the bytes pass through
//! to the process untouched.

/// A recognized pseudo-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoCommand {
    /// Clear the client's rendered scrollback.
    Clear,
    /// Print the relay's capability summary.
    Help,
    /// Print the session's command history.
    History,
}

/// Static help text returned for the `help` pseudo-command.
pub const HELP_TEXT: &str = "\
ShellMux relay commands:\n\
  clear    clear the terminal scrollback (client-side)\n\
  help     show this message\n\
  history  show the commands entered in this session\n\
All other input is passed to the shell.\n";

/// Classifies an input write as a pseudo-command.
///
/// Returns `Some` only when the bytes form exactly one line (optionally
/// newline-terminated) whose trimmed content matches a pseudo-command.
pub fn classify(data: &[u8]) -> Option<PseudoCommand> {
    let text = std::str::from_utf8(data).ok()?;

    let line = text.strip_suffix('\n').unwrap_or(text);
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.contains('\n') {
        return None;
    }

    match line.trim() {
        "clear" => Some(PseudoCommand::Clear),
        "help" => Some(PseudoCommand::Help),
        "history" => Some(PseudoCommand::History),
        _ => None,
    }
}

/// Formats a session history as numbered lines, shell-style.
pub fn format_history(history: &[String]) -> String {
    if history.is_empty() {
        return "(no history)\n".to_string();
    }

    let mut out = String::new();
    for (i, line) in history.iter().enumerate() {
        out.push_str(&format!("{:5}  {}\n", i + 1, line));
    }
    out
}
