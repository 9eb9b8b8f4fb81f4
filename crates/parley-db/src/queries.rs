use anyhow::Result;
use rusqlite::{Connection, params};

use parley_types::models::{ConversationKind, ConversationRef};

use crate::Database;
use crate::models::{FileRow, MembershipRow, MessageRow, RoomRow, UserRow};

impl Database {
    // -- Users --

    pub fn create_user(&self, username: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO users (username) VALUES (?1)", [username])?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, is_online, last_seen FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        is_online: row.get(2)?,
                        last_seen: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn set_online(&self, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET is_online = 1 WHERE id = ?1", [user_id])?;
            Ok(())
        })
    }

    /// Everyone currently flagged online, for presence snapshots.
    pub fn online_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, is_online, last_seen FROM users WHERE is_online = 1",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        is_online: row.get(2)?,
                        last_seen: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Offline transition also stamps last_seen.
    pub fn set_offline(&self, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_online = 0, last_seen = datetime('now') WHERE id = ?1",
                [user_id],
            )?;
            Ok(())
        })
    }

    // -- Rooms --

    /// Fetch or lazily create the direct room between two users. The pair
    /// is stored low-id-first, so (a, b) and (b, a) resolve to one row.
    pub fn get_or_create_room(&self, user_1: i64, user_2: i64) -> Result<RoomRow> {
        let (a, b) = if user_1 < user_2 {
            (user_1, user_2)
        } else {
            (user_2, user_1)
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO rooms (user_a, user_b) VALUES (?1, ?2)",
                [a, b],
            )?;
            let row = conn.query_row(
                "SELECT id, user_a, user_b FROM rooms WHERE user_a = ?1 AND user_b = ?2",
                [a, b],
                |row| {
                    Ok(RoomRow {
                        id: row.get(0)?,
                        user_a: row.get(1)?,
                        user_b: row.get(2)?,
                    })
                },
            )?;
            Ok(row)
        })
    }

    pub fn get_room(&self, id: i64) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_a, user_b FROM rooms WHERE id = ?1",
                [id],
                |row| {
                    Ok(RoomRow {
                        id: row.get(0)?,
                        user_a: row.get(1)?,
                        user_b: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Groups / channels --

    pub fn create_group(&self, name: &str, description: Option<&str>, created_by: i64) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO groups (name, description, created_by) VALUES (?1, ?2, ?3)",
                params![name, description, created_by],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO memberships (kind, conversation_id, user_id, role)
                 VALUES ('group', ?1, ?2, 'owner')",
                [id, created_by],
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn create_channel(&self, name: &str, description: Option<&str>, owner_id: i64) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channels (name, description, owner_id) VALUES (?1, ?2, ?3)",
                params![name, description, owner_id],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO memberships (kind, conversation_id, user_id, role)
                 VALUES ('channel', ?1, ?2, 'owner')",
                [id, owner_id],
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn conversation_exists(&self, conv: ConversationRef) -> Result<bool> {
        let table = match conv.kind {
            ConversationKind::Room => "rooms",
            ConversationKind::Group => "groups",
            ConversationKind::Channel => "channels",
        };
        self.with_conn(|conn| {
            let sql = format!("SELECT 1 FROM {table} WHERE id = ?1");
            Ok(conn
                .query_row(&sql, [conv.id], |_| Ok(()))
                .optional()?
                .is_some())
        })
    }

    // -- Memberships --

    pub fn is_member(&self, conv: ConversationRef, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| match conv.kind {
            ConversationKind::Room => Ok(conn
                .query_row(
                    "SELECT 1 FROM rooms WHERE id = ?1 AND (user_a = ?2 OR user_b = ?2)",
                    [conv.id, user_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some()),
            _ => Ok(conn
                .query_row(
                    "SELECT 1 FROM memberships
                     WHERE kind = ?1 AND conversation_id = ?2 AND user_id = ?3",
                    params![conv.kind.as_str(), conv.id, user_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some()),
        })
    }

    /// Role within a group/channel; rooms carry no roles.
    pub fn membership_role(&self, conv: ConversationRef, user_id: i64) -> Result<Option<String>> {
        if conv.kind == ConversationKind::Room {
            return Ok(None);
        }
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT role FROM memberships
                 WHERE kind = ?1 AND conversation_id = ?2 AND user_id = ?3",
                params![conv.kind.as_str(), conv.id, user_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Returns false when the membership already existed.
    pub fn add_membership(&self, conv: ConversationRef, user_id: i64, role: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO memberships (kind, conversation_id, user_id, role)
                 VALUES (?1, ?2, ?3, ?4)",
                params![conv.kind.as_str(), conv.id, user_id, role],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn remove_membership(&self, conv: ConversationRef, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM memberships
                 WHERE kind = ?1 AND conversation_id = ?2 AND user_id = ?3",
                params![conv.kind.as_str(), conv.id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_membership_role(
        &self,
        conv: ConversationRef,
        user_id: i64,
        role: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE memberships SET role = ?4
                 WHERE kind = ?1 AND conversation_id = ?2 AND user_id = ?3",
                params![conv.kind.as_str(), conv.id, user_id, role],
            )?;
            Ok(changed > 0)
        })
    }

    /// All member ids of a conversation; for rooms, the two participants.
    pub fn member_ids(&self, conv: ConversationRef) -> Result<Vec<i64>> {
        self.with_conn(|conn| match conv.kind {
            ConversationKind::Room => {
                let pair = conn
                    .query_row(
                        "SELECT user_a, user_b FROM rooms WHERE id = ?1",
                        [conv.id],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                Ok(pair.map(|(a, b)| vec![a, b]).unwrap_or_default())
            }
            _ => {
                let mut stmt = conn.prepare(
                    "SELECT user_id FROM memberships
                     WHERE kind = ?1 AND conversation_id = ?2",
                )?;
                let ids = stmt
                    .query_map(params![conv.kind.as_str(), conv.id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?;
                Ok(ids)
            }
        })
    }

    pub fn list_memberships(&self, conv: ConversationRef) -> Result<Vec<MembershipRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, role, joined_at FROM memberships
                 WHERE kind = ?1 AND conversation_id = ?2 ORDER BY joined_at",
            )?;
            let rows = stmt
                .query_map(params![conv.kind.as_str(), conv.id], |row| {
                    Ok(MembershipRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        role: row.get(2)?,
                        joined_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        conv: ConversationRef,
        sender_id: i64,
        content: Option<&str>,
        file_id: Option<i64>,
        reply_to: Option<i64>,
        message_type: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (kind, conversation_id, sender_id, content, file_id, reply_to, message_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    conv.kind.as_str(),
                    conv.id,
                    sender_id,
                    content,
                    file_id,
                    reply_to,
                    message_type
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_message(&self, conv: ConversationRef, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{MESSAGE_SELECT} WHERE m.id = ?1 AND m.kind = ?2 AND m.conversation_id = ?3"),
                params![id, conv.kind.as_str(), conv.id],
                map_message,
            )
            .optional()
        })
    }

    /// Most recent messages, newest first; ties broken by row id.
    pub fn recent_messages(&self, conv: ConversationRef, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.kind = ?1 AND m.conversation_id = ?2
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![conv.kind.as_str(), conv.id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Guarded edit: only touches the row while it still belongs to
    /// `sender_id`, closing the race with a concurrent delete. Never
    /// changes created_at.
    pub fn update_message_text(
        &self,
        conv: ConversationRef,
        id: i64,
        sender_id: i64,
        text: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?5, edited = 1
                 WHERE id = ?1 AND kind = ?2 AND conversation_id = ?3 AND sender_id = ?4",
                params![id, conv.kind.as_str(), conv.id, sender_id, text],
            )?;
            Ok(changed)
        })
    }

    /// Delete a message and cascade its read marks and attached file row.
    /// `sender_guard` restricts deletion to the author; pass None for an
    /// owner-level delete. Returns the attached file id when a row was
    /// actually deleted.
    pub fn delete_message(
        &self,
        conv: ConversationRef,
        id: i64,
        sender_guard: Option<i64>,
    ) -> Result<Option<Option<i64>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let found = tx
                .query_row(
                    "SELECT sender_id, file_id FROM messages
                     WHERE id = ?1 AND kind = ?2 AND conversation_id = ?3",
                    params![id, conv.kind.as_str(), conv.id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
                )
                .optional()?;
            let Some((sender_id, file_id)) = found else {
                return Ok(None);
            };
            if let Some(guard) = sender_guard {
                if sender_id != guard {
                    return Ok(None);
                }
            }
            tx.execute("DELETE FROM message_reads WHERE message_id = ?1", [id])?;
            tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            if let Some(fid) = file_id {
                tx.execute("DELETE FROM files WHERE id = ?1", [fid])?;
            }
            tx.commit()?;
            Ok(Some(file_id))
        })
    }

    // -- Read state --

    /// Idempotent single-reader mark for room messages.
    pub fn mark_room_message_read(&self, conv: ConversationRef, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE id = ?1 AND kind = 'room' AND conversation_id = ?2",
                [id, conv.id],
            )?;
            Ok(())
        })
    }

    /// Idempotent multi-reader mark; returns false when already marked.
    pub fn add_read_mark(&self, message_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?1, ?2)",
                [message_id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Batch-fetch (message_id, reader_id) pairs for a set of messages.
    pub fn read_marks(&self, message_ids: &[i64]) -> Result<Vec<(i64, i64)>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id FROM message_reads WHERE message_id IN ({})",
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();
            let rows = stmt
                .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Messages in the conversation not authored and not yet read by
    /// `user_id`. Always recomputed from scratch; deletes and multi-reader
    /// semantics make incremental counters drift.
    pub fn unread_count(&self, conv: ConversationRef, user_id: i64) -> Result<i64> {
        self.with_conn(|conn| match conv.kind {
            ConversationKind::Room => {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM messages
                     WHERE kind = 'room' AND conversation_id = ?1
                       AND sender_id <> ?2 AND is_read = 0",
                    [conv.id, user_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            }
            _ => {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM messages m
                     WHERE m.kind = ?1 AND m.conversation_id = ?2 AND m.sender_id <> ?3
                       AND NOT EXISTS (
                           SELECT 1 FROM message_reads r
                           WHERE r.message_id = m.id AND r.user_id = ?3
                       )",
                    params![conv.kind.as_str(), conv.id, user_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            }
        })
    }

    // -- Files --

    pub fn insert_file(
        &self,
        uploader_id: i64,
        conv: ConversationRef,
        name: &str,
        size: i64,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files (uploader_id, kind, conversation_id, name, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![uploader_id, conv.kind.as_str(), conv.id, name, size],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_file(&self, conv: ConversationRef, id: i64) -> Result<Option<FileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, uploader_id, kind, conversation_id, name, size, created_at
                 FROM files WHERE id = ?1 AND kind = ?2 AND conversation_id = ?3",
                params![id, conv.kind.as_str(), conv.id],
                map_file,
            )
            .optional()
        })
    }

    pub fn get_file_by_id(&self, id: i64) -> Result<Option<FileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, uploader_id, kind, conversation_id, name, size, created_at
                 FROM files WHERE id = ?1",
                [id],
                map_file,
            )
            .optional()
        })
    }

    /// Conversation file library, newest first.
    pub fn list_files(&self, conv: ConversationRef) -> Result<Vec<FileRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, uploader_id, kind, conversation_id, name, size, created_at
                 FROM files WHERE kind = ?1 AND conversation_id = ?2
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![conv.kind.as_str(), conv.id], map_file)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete a file row plus the message carrying it. Returns the id of
    /// the removed message, if the attachment had one.
    pub fn delete_file_cascade(
        &self,
        conv: ConversationRef,
        file_id: i64,
    ) -> Result<Option<Option<i64>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM files WHERE id = ?1 AND kind = ?2 AND conversation_id = ?3",
                    params![file_id, conv.kind.as_str(), conv.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }
            let message_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM messages
                     WHERE file_id = ?1 AND kind = ?2 AND conversation_id = ?3",
                    params![file_id, conv.kind.as_str(), conv.id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(mid) = message_id {
                tx.execute("DELETE FROM message_reads WHERE message_id = ?1", [mid])?;
                tx.execute("DELETE FROM messages WHERE id = ?1", [mid])?;
            }
            tx.execute("DELETE FROM files WHERE id = ?1", [file_id])?;
            tx.commit()?;
            Ok(Some(message_id))
        })
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.kind, m.conversation_id, m.sender_id, u.username,
        m.content, m.file_id, m.reply_to, m.message_type, m.created_at, m.edited, m.is_read
 FROM messages m
 LEFT JOIN users u ON m.sender_id = u.id";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        sender_username: row
            .get::<_, Option<String>>(4)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(5)?,
        file_id: row.get(6)?,
        reply_to: row.get(7)?,
        message_type: row.get(8)?,
        created_at: row.get(9)?,
        edited: row.get(10)?,
        is_read: row.get(11)?,
    })
}

fn map_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        id: row.get(0)?,
        uploader_id: row.get(1)?,
        kind: row.get(2)?,
        conversation_id: row.get(3)?,
        name: row.get(4)?,
        size: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Extension trait for optional query results.
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
