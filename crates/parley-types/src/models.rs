use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three conversation families. Every conversation is addressed by
/// (kind, id); ids are only unique within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Room,
    Group,
    Channel,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Room => "room",
            ConversationKind::Group => "group",
            ConversationKind::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "room" => Some(ConversationKind::Room),
            "group" => Some(ConversationKind::Group),
            "channel" => Some(ConversationKind::Channel),
            _ => None,
        }
    }
}

/// A (kind, id) reference to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationRef {
    pub kind: ConversationKind,
    pub id: i64,
}

impl ConversationRef {
    pub fn room(id: i64) -> Self {
        Self { kind: ConversationKind::Room, id }
    }

    pub fn group(id: i64) -> Self {
        Self { kind: ConversationKind::Group, id }
    }

    pub fn channel(id: i64) -> Self {
        Self { kind: ConversationKind::Channel, id }
    }

    /// Deterministic fan-out group name for this conversation. Any process
    /// can derive it without shared discovery state.
    pub fn group_name(&self) -> String {
        match self.kind {
            ConversationKind::Room => format!("chat_{}", self.id),
            ConversationKind::Group => format!("group_{}", self.id),
            ConversationKind::Channel => format!("channel_{}", self.id),
        }
    }
}

/// Membership role. Groups use owner/admin/member, channels use
/// owner/subscriber; rooms carry no roles at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
    Subscriber,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Subscriber => "subscriber",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            "subscriber" => Some(Role::Subscriber),
            _ => None,
        }
    }
}

/// Read state of one message. Rooms have a single possible reader, so a
/// boolean suffices; groups and channels track the set of reader ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadState {
    Single(bool),
    Multi(BTreeSet<i64>),
}

impl ReadState {
    /// An author has implicitly read their own message.
    pub fn is_read_by(&self, user_id: i64, author_id: i64) -> bool {
        if user_id == author_id {
            return true;
        }
        match self {
            ReadState::Single(read) => *read,
            ReadState::Multi(readers) => readers.contains(&user_id),
        }
    }
}

/// MIME category derived from the filename extension. Clients key icons
/// and previews off this; unknown extensions fall back to `File`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Pdf,
    Word,
    Excel,
    Archive,
    Text,
    File,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        let ext = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return FileKind::File,
        };
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" => FileKind::Image,
            "mp4" | "avi" | "mov" | "wmv" => FileKind::Video,
            "mp3" | "wav" | "ogg" | "flac" => FileKind::Audio,
            "pdf" => FileKind::Pdf,
            "doc" | "docx" => FileKind::Word,
            "xls" | "xlsx" => FileKind::Excel,
            "zip" | "rar" | "7z" => FileKind::Archive,
            "txt" => FileKind::Text,
            _ => FileKind::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
}

/// Outbound file reference: a fetchable URL plus metadata. The download
/// endpoint itself lives outside this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub size: i64,
    pub kind: FileKind,
}

/// Wire shape of the per-kind read state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadPayload {
    Single { is_read: bool },
    Multi { read_by: Vec<i64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: i64,
    pub sender: UserRef,
    pub content: Option<String>,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FilePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    #[serde(flatten)]
    pub read: ReadPayload,
}
