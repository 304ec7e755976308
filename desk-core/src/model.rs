use chrono::{DateTime, Utc};
use desk_channels::{MessageId, ThreadId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(i64);

impl TicketId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TicketId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Closed,
}

/// Staff or user intent that may move a ticket between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketAction {
    Take,
    Close,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Closed
    }

    /// Target status for `action`, or `None` when the action does not apply.
    /// `Closed` is terminal.
    pub fn next(self, action: TicketAction) -> Option<Self> {
        match (self, action) {
            (Self::Open, TicketAction::Take) => Some(Self::InProgress),
            (Self::Open | Self::InProgress, TicketAction::Close) => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown ticket status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub user_id: UserId,
    pub user_handle: String,
    pub title: String,
    pub last_message: String,
    pub created_at: DateTime<Utc>,
    pub status: TicketStatus,
    pub thread_id: Option<ThreadId>,
    /// Staff-facing card inside the bound thread.
    pub card_message_id: Option<MessageId>,
}

impl Ticket {
    pub fn from_draft(id: TicketId, draft: NewTicket) -> Self {
        Self {
            id,
            user_id: draft.user_id,
            user_handle: draft.user_handle,
            title: draft.title,
            last_message: draft.last_message,
            created_at: draft.created_at,
            status: TicketStatus::Open,
            thread_id: None,
            card_message_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicket {
    pub user_id: UserId,
    pub user_handle: String,
    pub title: String,
    pub last_message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    User,
    Staff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: i64,
    pub ticket_id: TicketId,
    pub origin_message_id: MessageId,
    pub sender_id: UserId,
    pub sender_handle: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicketMessage {
    pub ticket_id: TicketId,
    pub origin_message_id: MessageId,
    pub sender_id: UserId,
    pub sender_handle: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_open_in_progress_closed() {
        use TicketAction::*;
        use TicketStatus::*;

        assert_eq!(Open.next(Take), Some(InProgress));
        assert_eq!(Open.next(Close), Some(Closed));
        assert_eq!(InProgress.next(Close), Some(Closed));
        assert_eq!(InProgress.next(Take), None, "take is not re-applied");
        assert_eq!(Closed.next(Take), None, "closed is terminal");
        assert_eq!(Closed.next(Close), None, "closed is terminal");
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<TicketStatus>(), Ok(status));
        }
        assert!("reopened".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn ticket_id_parses_trimmed_decimal() {
        assert_eq!(" 42 ".parse::<TicketId>(), Ok(TicketId::new(42)));
        assert!("4x2".parse::<TicketId>().is_err());
    }
}
