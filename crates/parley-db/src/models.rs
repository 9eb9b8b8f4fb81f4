//! Database row types; these map directly to SQLite rows.
//! Distinct from the parley-types wire models to keep the DB layer
//! independent of payload shapes.

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub is_online: bool,
    pub last_seen: Option<String>,
}

pub struct RoomRow {
    pub id: i64,
    pub user_a: i64,
    pub user_b: i64,
}

impl RoomRow {
    /// The participant that is not `user_id`.
    pub fn other(&self, user_id: i64) -> i64 {
        if self.user_a == user_id {
            self.user_b
        } else {
            self.user_a
        }
    }
}

pub struct MembershipRow {
    pub conversation_id: i64,
    pub user_id: i64,
    pub role: String,
    pub joined_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub kind: String,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub content: Option<String>,
    pub file_id: Option<i64>,
    pub reply_to: Option<i64>,
    pub message_type: String,
    pub created_at: String,
    pub edited: bool,
    pub is_read: bool,
}

pub struct FileRow {
    pub id: i64,
    pub uploader_id: i64,
    pub kind: Option<String>,
    pub conversation_id: Option<i64>,
    pub name: String,
    pub size: i64,
    pub created_at: String,
}
