//! Ticket lifecycle: `open → in_progress → closed`, with at most one non-closed
//! ticket per user.
//!
//! Check-then-act sequences are serialized with keyed locks. Callers first claim a
//! slot (`claim_user`, `claim_ticket`) and keep it for as long as the sequence and its
//! side effects must not interleave with another request for the same key. Lock
//! order is user before ticket.

use crate::error::{DeskError, Result};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::model::{NewTicket, Ticket, TicketAction, TicketId, TicketStatus};
use crate::store::TicketStore;
use desk_channels::UserId;
use std::sync::Arc;

pub struct UserSlot {
    guard: KeyedGuard<UserId>,
}

impl UserSlot {
    pub fn user(&self) -> UserId {
        *self.guard.key()
    }
}

pub struct TicketSlot {
    guard: KeyedGuard<TicketId>,
}

impl TicketSlot {
    pub fn ticket_id(&self) -> TicketId {
        *self.guard.key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The user already had a non-closed ticket; nothing was created.
    Existing(Ticket),
    Created(Ticket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied {
        ticket: Ticket,
        previous: TicketStatus,
    },
    /// The action does not apply to the current status; nothing was written.
    Unchanged(Ticket),
}

impl Transition {
    pub fn ticket(&self) -> &Ticket {
        match self {
            Self::Applied { ticket, .. } | Self::Unchanged(ticket) => ticket,
        }
    }
}

pub struct TicketLifecycle {
    store: Arc<dyn TicketStore>,
    users: KeyedLocks<UserId>,
    tickets: KeyedLocks<TicketId>,
}

impl TicketLifecycle {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self {
            store,
            users: KeyedLocks::new(),
            tickets: KeyedLocks::new(),
        }
    }

    pub async fn claim_user(&self, user: UserId) -> UserSlot {
        UserSlot {
            guard: self.users.lock(user).await,
        }
    }

    pub async fn claim_ticket(&self, ticket: TicketId) -> TicketSlot {
        TicketSlot {
            guard: self.tickets.lock(ticket).await,
        }
    }

    pub async fn active_ticket(&self, slot: &UserSlot) -> Result<Option<Ticket>> {
        self.store.active_ticket_for_user(slot.user()).await
    }

    pub async fn open_ticket(&self, slot: &UserSlot, draft: NewTicket) -> Result<Admission> {
        debug_assert_eq!(draft.user_id, slot.user(), "draft must belong to the claimed user");
        if let Some(existing) = self.active_ticket(slot).await? {
            return Ok(Admission::Existing(existing));
        }
        match self.store.insert_ticket(&draft).await {
            Ok(id) => {
                tracing::info!(ticket_id = %id, user_id = %draft.user_id, "ticket opened");
                Ok(Admission::Created(Ticket::from_draft(id, draft)))
            }
            // Another writer on the same database got there first.
            Err(DeskError::ActiveTicketExists(user)) => match self.active_ticket(slot).await? {
                Some(existing) => Ok(Admission::Existing(existing)),
                None => Err(DeskError::ActiveTicketExists(user)),
            },
            Err(error) => Err(error),
        }
    }

    pub async fn apply(&self, slot: &TicketSlot, action: TicketAction) -> Result<Transition> {
        let id = slot.ticket_id();
        let mut ticket = self
            .store
            .ticket(id)
            .await?
            .ok_or(DeskError::TicketNotFound(id))?;
        let Some(next) = ticket.status.next(action) else {
            tracing::debug!(ticket_id = %id, status = %ticket.status, ?action, "transition not applicable");
            return Ok(Transition::Unchanged(ticket));
        };
        self.store.update_status(id, next).await?;
        let previous = ticket.status;
        ticket.status = next;
        tracing::info!(ticket_id = %id, from = %previous, to = %next, "ticket status changed");
        Ok(Transition::Applied { ticket, previous })
    }
}
