//! Session meta-commands.
//!
//! Input starting with `/` is checked against a closed command vocabulary,
//! case-insensitively. Anything unrecognized is not an error — it is a
//! normal message and the caller forwards it to the model.

// ---------------------------------------------------------------------------
// MetaCommand
// ---------------------------------------------------------------------------

/// A recognized session-control directive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaCommand {
    /// `/status` — show session status.
    Status,
    /// `/checkpoint [message]` — create a checkpoint with an optional
    /// label.
    Checkpoint { message: Option<String> },
    /// `/restore [checkpoint_id]` — restore a specific or the latest
    /// checkpoint.
    Restore { checkpoint_id: Option<String> },
    /// `/pin <message_id>` — pin a message against summarization.
    Pin { message_id: String },
    /// `/history [count]` — list the last N messages (default 20).
    History { count: usize },
}

/// Default count for `/history`.
pub const DEFAULT_HISTORY_COUNT: usize = 20;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse input for a meta-command. Returns `None` for ordinary messages,
/// unknown commands, and a `/pin` without its required argument.
#[must_use]
pub fn parse_meta_command(input: &str) -> Option<MetaCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next()?.to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or_default();

    match name.as_str() {
        "status" => Some(MetaCommand::Status),
        "checkpoint" => Some(MetaCommand::Checkpoint {
            message: (!args.is_empty()).then(|| args.to_owned()),
        }),
        "restore" => Some(MetaCommand::Restore {
            checkpoint_id: (!args.is_empty()).then(|| args.to_owned()),
        }),
        "pin" => {
            if args.is_empty() {
                // pin requires a message id
                None
            } else {
                Some(MetaCommand::Pin {
                    message_id: args.to_owned(),
                })
            }
        }
        "history" => Some(MetaCommand::History {
            count: args.parse().unwrap_or(DEFAULT_HISTORY_COUNT),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
