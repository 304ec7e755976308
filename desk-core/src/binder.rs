use crate::error::{DeskError, Result};
use crate::model::TicketId;
use crate::store::TicketStore;
use desk_channels::ThreadId;
use std::sync::Arc;

/// Thread → ticket mapping. A binding is written once when the thread is created and
/// never changes afterwards. Lookups go to the store's thread index, so the binder
/// holds no per-thread state of its own.
pub struct ThreadBinder {
    store: Arc<dyn TicketStore>,
}

impl ThreadBinder {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    pub async fn bind(&self, ticket: TicketId, thread: ThreadId) -> Result<()> {
        if !self.store.bind_thread(ticket, thread).await? {
            return Err(DeskError::ThreadAlreadyBound(ticket));
        }
        tracing::debug!(ticket_id = %ticket, thread_id = %thread, "thread bound");
        Ok(())
    }

    pub async fn resolve(&self, thread: ThreadId) -> Result<Option<TicketId>> {
        self.store.ticket_by_thread(thread).await
    }
}
