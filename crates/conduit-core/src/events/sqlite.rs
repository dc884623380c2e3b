//! SQLite-backed event log.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::error::{StorageError, StorageResult};
use crate::events::{EventLog, EventRecord, EventType, NewEvent, Notification};

const SELECT_COLUMNS: &str = "id, correlation_id, conversation_id, process_instance_id, \
                              crew_type, event_type, data_json, status, created_at";

/// Event log stored in a SQLite database.
///
/// Manages the connection and schema initialization. The connection sits
/// behind a mutex so one log can be shared across worker threads.
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    /// Opens (or creates) the log at `path`.
    ///
    /// # Errors
    /// * `StorageError::Connection` - If the database connection fails
    pub fn open(path: &str) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let log = Self { conn: Mutex::new(conn) };
        log.init_schema()?;
        Ok(log)
    }

    /// Opens an in-memory log for testing.
    ///
    /// # Errors
    /// * `StorageError::Connection` - If the database connection fails
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let log = Self { conn: Mutex::new(conn) };
        log.init_schema()?;
        Ok(log)
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Unavailable("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> StorageResult<()> {
        info!("Initializing event log schema");
        let conn = self.conn()?;

        // `seq` gives the insertion order find_all relies on.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                correlation_id TEXT NOT NULL,
                conversation_id TEXT,
                process_instance_id TEXT,
                crew_type TEXT,
                event_type TEXT NOT NULL,
                data_json TEXT NOT NULL,
                status TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                kind TEXT NOT NULL,
                description TEXT,
                tenant_id TEXT,
                url TEXT,
                from_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_conversation_id ON events(conversation_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_type_correlation ON events(event_type, correlation_id)",
            [],
        )?;

        info!("Event log schema initialized successfully");
        Ok(())
    }

    /// Number of notification rows, mostly useful in tests.
    pub fn notification_count(&self) -> StorageResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Row as stored; JSON and timestamp columns are decoded afterwards so a
/// bad row is reported with its event id.
struct StoredRow {
    id: String,
    correlation_id: String,
    conversation_id: Option<String>,
    process_instance_id: Option<String>,
    crew_type: Option<String>,
    event_type: String,
    data_json: String,
    status: Option<String>,
    created_at: String,
}

impl StoredRow {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            correlation_id: row.get(1)?,
            conversation_id: row.get(2)?,
            process_instance_id: row.get(3)?,
            crew_type: row.get(4)?,
            event_type: row.get(5)?,
            data_json: row.get(6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_record(self) -> StorageResult<EventRecord> {
        let data = serde_json::from_str(&self.data_json).map_err(|e| StorageError::CorruptRecord {
            event_id: self.id.clone(),
            column: "data_json",
            reason: e.to_string(),
        })?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::CorruptRecord {
                event_id: self.id.clone(),
                column: "created_at",
                reason: e.to_string(),
            })?;

        Ok(EventRecord {
            id: self.id,
            correlation_id: self.correlation_id,
            conversation_id: self.conversation_id,
            process_instance_id: self.process_instance_id,
            crew_type: self.crew_type,
            event_type: EventType::parse(&self.event_type),
            data,
            status: self.status,
            created_at,
        })
    }
}

impl EventLog for SqliteEventLog {
    fn append(&self, event: NewEvent) -> StorageResult<String> {
        if event.correlation_id.is_empty() {
            return Err(StorageError::MissingCorrelation {
                event_type: event.event_type.as_str().to_string(),
            });
        }
        let id = Uuid::new_v4().to_string();
        let data_json = serde_json::to_string(&event.data)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (id, correlation_id, conversation_id, process_instance_id, crew_type, event_type, data_json, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                event.correlation_id,
                event.conversation_id,
                event.process_instance_id,
                event.crew_type,
                event.event_type.as_str(),
                data_json,
                event.status,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(event_id = %id, event_type = %event.event_type, "Appended event");
        Ok(id)
    }

    fn find_latest(
        &self,
        event_type: &EventType,
        correlation_id: &str,
    ) -> StorageResult<Option<EventRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events WHERE event_type = ?1 AND correlation_id = ?2 ORDER BY seq DESC LIMIT 1"
        );
        conn.query_row(&sql, params![event_type.as_str(), correlation_id], StoredRow::read)
            .optional()?
            .map(StoredRow::into_record)
            .transpose()
    }

    fn find_all(&self, conversation_id: &str) -> StorageResult<Vec<EventRecord>> {
        let conn = self.conn()?;
        let sql =
            format!("SELECT {SELECT_COLUMNS} FROM events WHERE conversation_id = ?1 ORDER BY seq ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![conversation_id], StoredRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_record).collect()
    }

    fn append_notification(&self, notification: Notification) -> StorageResult<()> {
        if notification.recipients.is_empty() {
            return Err(StorageError::NoRecipients { title: notification.title });
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for user_id in &notification.recipients {
            tx.execute(
                "INSERT INTO notifications (id, user_id, title, kind, description, tenant_id, url, from_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    notification.title,
                    notification.kind,
                    notification.description,
                    notification.tenant_id,
                    notification.url,
                    notification.from_id,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        debug!(recipients = notification.recipients.len(), "Stored notification");
        Ok(())
    }
}
