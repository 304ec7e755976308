//! Inline button payloads: `<tag>[:<ticket id>]`, e.g. `take:7`, `view:12`, `list`.

use crate::model::{TicketAction, TicketId};
use thiserror::Error;

const SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    /// Staff status change on a ticket card.
    Staff(TicketAction, TicketId),
    /// User opens the detail view of one of their tickets.
    View(TicketId),
    /// User goes back to their ticket list.
    List,
    /// User goes back to the main menu.
    Menu,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("unknown button tag {0:?}")]
    UnknownTag(String),

    #[error("invalid ticket id in button payload {0:?}")]
    BadTicketId(String),
}

impl ButtonAction {
    pub fn encode(&self) -> String {
        match self {
            Self::Staff(TicketAction::Take, id) => format!("take{SEPARATOR}{id}"),
            Self::Staff(TicketAction::Close, id) => format!("close{SEPARATOR}{id}"),
            Self::View(id) => format!("view{SEPARATOR}{id}"),
            Self::List => "list".to_string(),
            Self::Menu => "menu".to_string(),
        }
    }

    /// Parse a payload as delivered by the transport. Leading control characters some
    /// clients prepend are ignored.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let data = raw.trim_start_matches(|c: char| c.is_control() || c.is_whitespace());
        let data = data.trim_end();
        let (tag, rest) = match data.split_once(SEPARATOR) {
            Some((tag, rest)) => (tag, Some(rest)),
            None => (data, None),
        };
        let ticket_id = || -> Result<TicketId, PayloadError> {
            rest.and_then(|rest| rest.parse::<TicketId>().ok())
                .filter(|id| id.get() > 0)
                .ok_or_else(|| PayloadError::BadTicketId(data.to_string()))
        };
        match tag {
            "take" => Ok(Self::Staff(TicketAction::Take, ticket_id()?)),
            "close" => Ok(Self::Staff(TicketAction::Close, ticket_id()?)),
            "view" => Ok(Self::View(ticket_id()?)),
            "list" if rest.is_none() => Ok(Self::List),
            "menu" if rest.is_none() => Ok(Self::Menu),
            other => Err(PayloadError::UnknownTag(other.to_string())),
        }
    }
}
