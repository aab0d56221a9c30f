use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::{IdentityId, Message};

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, sender, receiver, content, date, seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.sender.as_str(),
                message.receiver.as_str(),
                message.content,
                message.date.to_rfc3339_opts(SecondsFormat::Micros, true),
                message.seen,
            ],
        )?;
        Ok(())
    }

    /// Every message the identity sent or received, oldest first.
    pub fn messages_for(&self, identity: &IdentityId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sender, receiver, content, date, seen
             FROM messages
             WHERE sender = ?1 OR receiver = ?1
             ORDER BY date ASC",
        )?;

        let rows = stmt.query_map(params![identity.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Flag every unseen message from `sender` to `receiver` as seen.
    ///
    /// Returns the number of rows updated.
    pub fn mark_seen(&self, sender: &IdentityId, receiver: &IdentityId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET seen = 1
             WHERE sender = ?1 AND receiver = ?2 AND seen = 0",
            params![sender.as_str(), receiver.as_str()],
        )?;
        Ok(affected)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let receiver: String = row.get(2)?;
    let content: String = row.get(3)?;
    let date_str: String = row.get(4)?;
    let seen: bool = row.get(5)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let date: DateTime<Utc> = DateTime::parse_from_rfc3339(&date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id,
        sender: IdentityId(sender),
        receiver: IdentityId(receiver),
        content,
        date,
        seen,
    })
}
