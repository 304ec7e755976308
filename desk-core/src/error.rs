use crate::model::TicketId;
use desk_channels::UserId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeskError>;

#[derive(Debug, Error)]
pub enum DeskError {
    #[error("ticket #{0} not found")]
    TicketNotFound(TicketId),

    #[error("ticket #{ticket} is not owned by user {user}")]
    NotOwner { ticket: TicketId, user: UserId },

    #[error("user {0} already has an active ticket")]
    ActiveTicketExists(UserId),

    #[error("ticket #{0} is already bound to a thread")]
    ThreadAlreadyBound(TicketId),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl DeskError {
    pub(crate) fn transport(error: anyhow::Error) -> Self {
        Self::Transport(format!("{error:#}"))
    }
}

impl From<rusqlite::Error> for DeskError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for DeskError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Store(format!("store task failed: {e}"))
    }
}
