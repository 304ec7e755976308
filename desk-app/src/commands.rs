//! Slash-command parser for private chats.

use desk_core::{Command, TicketId};

pub fn is_command(input: &str) -> bool {
    input.trim_start().starts_with('/')
}

/// Parse `/name[@bot] [args]`. Returns `None` for plain text, unknown commands and
/// commands addressed to a different bot.
pub fn parse_command(input: &str, bot_username: Option<&str>) -> Option<Command> {
    let trimmed = input.trim();
    let rest = trimmed.strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let head = parts.next()?;

    let (name, target) = match head.split_once('@') {
        Some((name, target)) => (name, Some(target)),
        None => (head, None),
    };
    if let (Some(target), Some(bot)) = (target, bot_username) {
        if !target.eq_ignore_ascii_case(bot.trim_start_matches('@')) {
            return None;
        }
    }

    match name.to_ascii_lowercase().as_str() {
        "start" => Some(Command::Start),
        "help" => Some(Command::Help),
        "mytickets" => Some(Command::MyTickets),
        "history" => Some(Command::History(
            parts
                .next()
                .map(|arg| arg.trim_start_matches('#'))
                .and_then(|arg| arg.parse::<TicketId>().ok())
                .filter(|id| id.get() > 0),
        )),
        _ => None,
    }
}
