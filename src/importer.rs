/// Read-only access to the Messages database (`~/Library/Messages/chat.db`).
///
/// Only the columns the link resolver needs are read. Relevant schema:
/// ```sql
/// CREATE TABLE message (
///     ROWID                   INTEGER PRIMARY KEY AUTOINCREMENT,
///     guid                    TEXT UNIQUE NOT NULL,
///     text                    TEXT,
///     date                    INTEGER,
///     associated_message_guid TEXT,     -- set on tapbacks; those rows are skipped
///     payload_data            BLOB      -- NSKeyedArchiver rich-link metadata
/// );
/// CREATE TABLE attachment (
///     ROWID     INTEGER PRIMARY KEY AUTOINCREMENT,
///     guid      TEXT UNIQUE NOT NULL,
///     filename  TEXT,                   -- usually "~/Library/Messages/Attachments/.."
///     mime_type TEXT
/// );
/// CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
/// ```
use eyre::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::path::Path;

/// A message that may carry links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRow {
    pub id: i64,
    pub text: String,
    pub has_payload: bool,
}

/// Owned by the database layer; the resolver only ever reads it by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageAttachment {
    pub id: i64,
    pub guid: String,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

/// The slice of the database layer the resolver depends on.
pub trait MessageSource {
    /// Non-tapback messages with text, oldest first.
    fn messages(&self) -> Result<Vec<MessageRow>>;
    /// Raw rich-link blob, if the message has one.
    fn payload(&self, message_id: i64) -> Result<Option<Vec<u8>>>;
    /// Attachments in ROWID order; positions are what rich-link indices refer to.
    fn attachments(&self, message_id: i64) -> Result<Vec<MessageAttachment>>;
}

pub struct ChatDb {
    conn: Connection,
}

impl ChatDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .wrap_err_with(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA cache_size = -16384;")
            .wrap_err("Failed to set cache_size")?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl MessageSource for ChatDb {
    fn messages(&self) -> Result<Vec<MessageRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT m.ROWID, m.text, \
                        m.payload_data IS NOT NULL AND length(m.payload_data) > 0 \
                 FROM message m \
                 WHERE m.associated_message_guid IS NULL \
                   AND m.text IS NOT NULL AND m.text != '' \
                 ORDER BY m.date ASC, m.ROWID ASC",
            )
            .wrap_err("Failed to prepare message query")?;
        stmt.query_map([], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                text: row.get(1)?,
                has_payload: row.get(2)?,
            })
        })?
        .collect::<Result<_, _>>()
        .wrap_err("Failed to read messages")
    }

    fn payload(&self, message_id: i64) -> Result<Option<Vec<u8>>> {
        let blob: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT payload_data FROM message WHERE ROWID = ?",
                [message_id],
                |row| row.get(0),
            )
            .optional()
            .wrap_err_with(|| format!("Failed to read payload for message {message_id}"))?;
        Ok(blob.flatten().filter(|b| !b.is_empty()))
    }

    fn attachments(&self, message_id: i64) -> Result<Vec<MessageAttachment>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT a.ROWID, a.guid, a.mime_type, a.filename \
                 FROM attachment a \
                 JOIN message_attachment_join j ON a.ROWID = j.attachment_id \
                 WHERE j.message_id = ? \
                 ORDER BY a.ROWID",
            )
            .wrap_err("Failed to prepare attachment query")?;
        stmt.query_map([message_id], |row| {
            Ok(MessageAttachment {
                id: row.get(0)?,
                guid: row.get(1)?,
                mime_type: row.get(2)?,
                filename: row.get(3)?,
            })
        })?
        .collect::<Result<_, _>>()
        .wrap_err_with(|| format!("Failed to read attachments for message {message_id}"))
    }
}
