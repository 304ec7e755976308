//! Ticket relay core: lifecycle, thread bindings, persistence and routing.
//!
//! Transport-agnostic. Everything platform-specific sits behind
//! `desk_channels::Transport`.

mod binder;
mod error;
mod lifecycle;
mod locks;
mod model;
mod payload;
mod relay;
mod render;
mod retention;
mod store;

pub use binder::ThreadBinder;
pub use error::{DeskError, Result};
pub use lifecycle::{Admission, TicketLifecycle, TicketSlot, Transition, UserSlot};
pub use locks::{KeyedGuard, KeyedLocks};
pub use model::{
    NewTicket, NewTicketMessage, Origin, Ticket, TicketAction, TicketId, TicketMessage,
    TicketStatus,
};
pub use payload::{ButtonAction, PayloadError};
pub use relay::{Command, RelayConfig, RelayEngine};
pub use retention::{run_sweeper, sweep_once};
pub use store::{SqliteStore, TicketStore};
