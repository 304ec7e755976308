//! Ticket persistence.
//!
//! `TicketStore` is the data-access contract the lifecycle and relay rely on; it
//! carries no policy. Every method is atomic on its own. `SqliteStore` implements it
//! over a single `rusqlite` connection whose calls run on the blocking pool.

use crate::error::{DeskError, Result};
use crate::model::{
    NewTicket, NewTicketMessage, Origin, Ticket, TicketId, TicketMessage, TicketStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use desk_channels::{MessageId, ThreadId, UserId};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Insert a ticket with status `open`. Fails with `ActiveTicketExists` when the
    /// user already owns a non-closed ticket.
    async fn insert_ticket(&self, draft: &NewTicket) -> Result<TicketId>;

    async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>>;

    /// Most recent non-closed ticket of `user`.
    async fn active_ticket_for_user(&self, user: UserId) -> Result<Option<Ticket>>;

    async fn update_status(&self, id: TicketId, status: TicketStatus) -> Result<()>;

    async fn update_last_message(&self, id: TicketId, text: &str) -> Result<()>;

    /// Record the thread for a ticket. Returns `false` without writing when the
    /// ticket is already bound.
    async fn bind_thread(&self, id: TicketId, thread: ThreadId) -> Result<bool>;

    async fn set_card_message(&self, id: TicketId, message: MessageId) -> Result<()>;

    async fn ticket_by_thread(&self, thread: ThreadId) -> Result<Option<TicketId>>;

    /// Tickets of `user`, newest first.
    async fn user_tickets(&self, user: UserId, limit: Option<usize>) -> Result<Vec<Ticket>>;

    async fn append_message(&self, draft: &NewTicketMessage) -> Result<i64>;

    /// History of a ticket, oldest first.
    async fn ticket_history(&self, id: TicketId) -> Result<Vec<TicketMessage>>;

    async fn count_messages(&self) -> Result<u64>;

    /// Delete the oldest history rows until at most `cap` remain. Returns the number removed.
    async fn purge_oldest_messages(&self, cap: u64) -> Result<u64>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tickets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    user_handle TEXT NOT NULL,
    title TEXT NOT NULL,
    last_message TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    thread_id INTEGER NOT NULL DEFAULT 0,
    card_message_id INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_active_user
    ON tickets(user_id) WHERE status != 'closed';
CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_thread
    ON tickets(thread_id) WHERE thread_id != 0;
CREATE TABLE IF NOT EXISTS ticket_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticket_id INTEGER NOT NULL REFERENCES tickets(id),
    message_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    user_handle TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_staff INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_ticket_messages_ticket
    ON ticket_messages(ticket_id, created_at);
CREATE INDEX IF NOT EXISTS idx_ticket_messages_created
    ON ticket_messages(created_at, id);
"#;

const TICKET_COLUMNS: &str = "id, user_id, user_handle, title, last_message, created_at, status, \
                              thread_id, card_message_id";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.as_ref().display(), journal_mode = %mode, "opened ticket store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| DeskError::Store("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl TicketStore for SqliteStore {
    async fn insert_ticket(&self, draft: &NewTicket) -> Result<TicketId> {
        let draft = draft.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO tickets (user_id, user_handle, title, last_message, created_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    draft.user_id.get(),
                    draft.user_handle,
                    draft.title,
                    draft.last_message,
                    encode_timestamp(draft.created_at),
                    TicketStatus::Open.as_str(),
                ],
            );
            match inserted {
                Ok(_) => Ok(TicketId::new(conn.last_insert_rowid())),
                Err(error) if is_constraint_violation(&error) => {
                    Err(DeskError::ActiveTicketExists(draft.user_id))
                }
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>> {
        self.with_conn(move |conn| {
            let ticket = conn
                .query_row(
                    &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                    params![id.get()],
                    ticket_from_row,
                )
                .optional()?;
            Ok(ticket)
        })
        .await
    }

    async fn active_ticket_for_user(&self, user: UserId) -> Result<Option<Ticket>> {
        self.with_conn(move |conn| {
            let ticket = conn
                .query_row(
                    &format!(
                        "SELECT {TICKET_COLUMNS} FROM tickets
                          WHERE user_id = ?1 AND status != 'closed'
                          ORDER BY id DESC LIMIT 1"
                    ),
                    params![user.get()],
                    ticket_from_row,
                )
                .optional()?;
            Ok(ticket)
        })
        .await
    }

    async fn update_status(&self, id: TicketId, status: TicketStatus) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tickets SET status = ?2 WHERE id = ?1",
                params![id.get(), status.as_str()],
            );
            match changed {
                Ok(0) => Err(DeskError::TicketNotFound(id)),
                Ok(_) => Ok(()),
                Err(error) if is_constraint_violation(&error) => {
                    Err(DeskError::Store(format!(
                        "ticket #{id} cannot become {status}: owner already has an active ticket"
                    )))
                }
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    async fn update_last_message(&self, id: TicketId, text: &str) -> Result<()> {
        let text = text.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tickets SET last_message = ?2 WHERE id = ?1",
                params![id.get(), text],
            )?;
            if changed == 0 {
                return Err(DeskError::TicketNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn bind_thread(&self, id: TicketId, thread: ThreadId) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tickets SET thread_id = ?2 WHERE id = ?1 AND thread_id = 0",
                params![id.get(), thread.get()],
            )?;
            if changed == 1 {
                return Ok(true);
            }
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tickets WHERE id = ?1)",
                params![id.get()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(DeskError::TicketNotFound(id));
            }
            Ok(false)
        })
        .await
    }

    async fn set_card_message(&self, id: TicketId, message: MessageId) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tickets SET card_message_id = ?2 WHERE id = ?1",
                params![id.get(), message.get()],
            )?;
            if changed == 0 {
                return Err(DeskError::TicketNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn ticket_by_thread(&self, thread: ThreadId) -> Result<Option<TicketId>> {
        self.with_conn(move |conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM tickets WHERE thread_id = ?1",
                    params![thread.get()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(id.map(TicketId::new))
        })
        .await
    }

    async fn user_tickets(&self, user: UserId, limit: Option<usize>) -> Result<Vec<Ticket>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|limit| limit as i64).unwrap_or(-1);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets
                  WHERE user_id = ?1
                  ORDER BY id DESC
                  LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![user.get(), limit], ticket_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn append_message(&self, draft: &NewTicketMessage) -> Result<i64> {
        let draft = draft.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO ticket_messages
                    (ticket_id, message_id, user_id, user_handle, text, created_at, is_staff)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    draft.ticket_id.get(),
                    draft.origin_message_id.get(),
                    draft.sender_id.get(),
                    draft.sender_handle,
                    draft.text,
                    encode_timestamp(draft.created_at),
                    draft.origin == Origin::Staff,
                ],
            );
            match inserted {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(error) if is_constraint_violation(&error) => {
                    Err(DeskError::TicketNotFound(draft.ticket_id))
                }
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    async fn ticket_history(&self, id: TicketId) -> Result<Vec<TicketMessage>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, ticket_id, message_id, user_id, user_handle, text, created_at, is_staff
                   FROM ticket_messages
                  WHERE ticket_id = ?1
                  ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![id.get()], message_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn count_messages(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM ticket_messages", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn purge_oldest_messages(&self, cap: u64) -> Result<u64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let count: i64 =
                tx.query_row("SELECT COUNT(*) FROM ticket_messages", [], |row| row.get(0))?;
            let excess = (count.max(0) as u64).saturating_sub(cap);
            if excess == 0 {
                return Ok(0);
            }
            let removed = tx.execute(
                "DELETE FROM ticket_messages
                  WHERE id IN (
                      SELECT id FROM ticket_messages
                       ORDER BY created_at ASC, id ASC
                       LIMIT ?1
                  )",
                params![excess as i64],
            )?;
            tx.commit()?;
            Ok(removed as u64)
        })
        .await
    }
}

/// Fixed-width RFC 3339 in UTC, so text order equals time order.
pub(crate) fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    let created_at: String = row.get(5)?;
    let status: String = row.get(6)?;
    let thread_id: i64 = row.get(7)?;
    let card_message_id: i64 = row.get(8)?;
    Ok(Ticket {
        id: TicketId::new(row.get(0)?),
        user_id: UserId::new(row.get(1)?),
        user_handle: row.get(2)?,
        title: row.get(3)?,
        last_message: row.get(4)?,
        created_at: decode_timestamp(5, &created_at)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into())
        })?,
        thread_id: (thread_id != 0).then(|| ThreadId::new(thread_id)),
        card_message_id: (card_message_id != 0).then(|| MessageId::new(card_message_id)),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<TicketMessage> {
    let created_at: String = row.get(6)?;
    let is_staff: bool = row.get(7)?;
    Ok(TicketMessage {
        id: row.get(0)?,
        ticket_id: TicketId::new(row.get(1)?),
        origin_message_id: MessageId::new(row.get(2)?),
        sender_id: UserId::new(row.get(3)?),
        sender_handle: row.get(4)?,
        text: row.get(5)?,
        created_at: decode_timestamp(6, &created_at)?,
        origin: if is_staff { Origin::Staff } else { Origin::User },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn draft(user: i64) -> NewTicket {
        NewTicket {
            user_id: UserId::new(user),
            user_handle: format!("user{user}"),
            title: format!("Request from User{user}"),
            last_message: "printer broken".to_string(),
            created_at: Utc::now(),
        }
    }

    fn message(ticket: TicketId, text: &str, at: DateTime<Utc>) -> NewTicketMessage {
        NewTicketMessage {
            ticket_id: ticket,
            origin_message_id: MessageId::new(1),
            sender_id: UserId::new(1),
            sender_handle: "user1".to_string(),
            text: text.to_string(),
            created_at: at,
            origin: Origin::User,
        }
    }

    #[tokio::test]
    async fn inserted_ticket_reads_back_open_and_unbound() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let id = store.insert_ticket(&draft(1)).await.expect("insert");
        let ticket = store.ticket(id).await.expect("fetch").expect("present");
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.thread_id, None);
        assert_eq!(ticket.card_message_id, None);
        assert_eq!(ticket.user_handle, "user1");
        assert!(store.ticket(TicketId::new(999)).await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn second_active_ticket_for_same_user_is_rejected() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let first = store.insert_ticket(&draft(1)).await.expect("insert");
        let err = store
            .insert_ticket(&draft(1))
            .await
            .expect_err("second active ticket must fail");
        assert!(matches!(err, DeskError::ActiveTicketExists(user) if user == UserId::new(1)));

        store
            .update_status(first, TicketStatus::Closed)
            .await
            .expect("close");
        assert!(store.active_ticket_for_user(UserId::new(1)).await.expect("query").is_none());
        let second = store.insert_ticket(&draft(1)).await.expect("insert after close");
        assert!(second > first, "ids are monotonic");
    }

    #[tokio::test]
    async fn update_on_missing_ticket_reports_not_found() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let missing = TicketId::new(41);
        assert!(matches!(
            store.update_status(missing, TicketStatus::Closed).await,
            Err(DeskError::TicketNotFound(id)) if id == missing
        ));
        assert!(matches!(
            store.update_last_message(missing, "x").await,
            Err(DeskError::TicketNotFound(_))
        ));
        assert!(matches!(
            store.append_message(&message(missing, "x", Utc::now())).await,
            Err(DeskError::TicketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn thread_binding_is_written_once() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let id = store.insert_ticket(&draft(1)).await.expect("insert");
        assert!(store.bind_thread(id, ThreadId::new(10)).await.expect("bind"));
        assert!(!store.bind_thread(id, ThreadId::new(11)).await.expect("rebind"));
        assert_eq!(
            store.ticket_by_thread(ThreadId::new(10)).await.expect("lookup"),
            Some(id)
        );
        assert_eq!(store.ticket_by_thread(ThreadId::new(11)).await.expect("lookup"), None);
        assert!(matches!(
            store.bind_thread(TicketId::new(77), ThreadId::new(12)).await,
            Err(DeskError::TicketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn user_tickets_are_newest_first_and_limited() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = store.insert_ticket(&draft(1)).await.expect("insert");
            store.update_status(id, TicketStatus::Closed).await.expect("close");
            ids.push(id);
        }
        store.insert_ticket(&draft(2)).await.expect("other user");

        let all = store.user_tickets(UserId::new(1), None).await.expect("list");
        let listed: Vec<TicketId> = all.iter().map(|t| t.id).collect();
        assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);

        let limited = store.user_tickets(UserId::new(1), Some(2)).await.expect("list");
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, ids[2]);
    }

    #[tokio::test]
    async fn history_is_ordered_by_timestamp_not_insert_order() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let id = store.insert_ticket(&draft(1)).await.expect("insert");
        let base = Utc::now();
        store
            .append_message(&message(id, "second", base + ChronoDuration::seconds(5)))
            .await
            .expect("append");
        store
            .append_message(&message(id, "first", base))
            .await
            .expect("append");
        let mut staff = message(id, "third", base + ChronoDuration::seconds(9));
        staff.origin = Origin::Staff;
        store.append_message(&staff).await.expect("append");

        let history = store.ticket_history(id).await.expect("history");
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(history[2].origin, Origin::Staff);
    }

    #[tokio::test]
    async fn purge_removes_oldest_rows_down_to_cap() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let id = store.insert_ticket(&draft(1)).await.expect("insert");
        let base = Utc::now();
        // Inserted newest-first so id order disagrees with time order.
        for i in (0..10).rev() {
            store
                .append_message(&message(id, &format!("m{i}"), base + ChronoDuration::seconds(i)))
                .await
                .expect("append");
        }
        assert_eq!(store.count_messages().await.expect("count"), 10);

        assert_eq!(store.purge_oldest_messages(20).await.expect("noop purge"), 0);
        assert_eq!(store.purge_oldest_messages(4).await.expect("purge"), 6);
        assert_eq!(store.count_messages().await.expect("count"), 4);

        let kept: Vec<String> = store
            .ticket_history(id)
            .await
            .expect("history")
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(kept, vec!["m6", "m7", "m8", "m9"]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("support.db");
        let id = {
            let store = SqliteStore::open(&path).expect("open store");
            let id = store.insert_ticket(&draft(5)).await.expect("insert");
            store.bind_thread(id, ThreadId::new(3)).await.expect("bind");
            id
        };
        let reopened = SqliteStore::open(&path).expect("reopen store");
        let ticket = reopened.ticket(id).await.expect("fetch").expect("present");
        assert_eq!(ticket.thread_id, Some(ThreadId::new(3)));
        assert_eq!(ticket.user_id, UserId::new(5));
    }
}
