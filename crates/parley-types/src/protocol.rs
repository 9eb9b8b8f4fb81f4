use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    ConversationKind, FilePayload, MessagePayload, Role, UserRef,
};

/// Actions accepted on a conversation socket.
/// Inbound envelope: `{ "action": "...", ...fields }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Send {
        message: String,
        #[serde(default)]
        reply_to: Option<i64>,
    },
    Edit {
        message_id: i64,
        new_message: String,
    },
    Delete {
        message_id: i64,
    },
    Read {
        message_id: i64,
    },
    UploadFile {
        file_name: String,
        file_data: String,
    },
    DeleteFile {
        file_id: i64,
    },
    GetHistory,
    GetFiles,
    GetUnreadCount,
    Typing,
    StopTyping,
}

/// Names of every recognized conversation action, quoted back to clients
/// that send an unknown one.
pub const VALID_ACTIONS: &[&str] = &[
    "send",
    "edit",
    "delete",
    "read",
    "upload_file",
    "delete_file",
    "get_history",
    "get_files",
    "get_unread_count",
    "typing",
    "stop_typing",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Video,
    Audio,
}

/// Actions accepted on a call-signaling socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallAction {
    JoinCall,
    LeaveCall,
    Invite {
        target_user_id: i64,
        call_type: CallType,
    },
    Offer {
        target_user_id: i64,
        sdp: String,
    },
    Answer {
        target_user_id: i64,
        sdp: String,
    },
    IceCandidate {
        target_user_id: i64,
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default)]
        sdp_m_line_index: Option<u16>,
    },
}

pub const VALID_CALL_ACTIONS: &[&str] = &[
    "join_call",
    "leave_call",
    "invite",
    "offer",
    "answer",
    "ice_candidate",
];

/// WebRTC signaling payload relayed between call participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type", rename_all = "snake_case")]
pub enum CallSignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}

/// Events pushed to clients.
/// Outbound envelope: `{ "type": "...", ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// History snapshot, newest first. Sent once on join and on demand.
    MessageHistory { messages: Vec<MessagePayload> },

    ChatMessage { message: MessagePayload },

    MessageUpdated { message: MessagePayload },

    MessageDeleted { message_id: i64 },

    /// A reader marked a message read.
    Read { message_id: i64, user_id: i64 },

    FileUploaded {
        message: MessagePayload,
        file: FilePayload,
    },

    FileDeleted {
        file_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
    },

    FileList { files: Vec<FilePayload> },

    /// Direct reply to get_unread_count.
    UnreadCount { count: i64 },

    /// Pushed through the notification relay after every mutation that can
    /// move the counter. `contact_id` is the other participant for rooms
    /// and the conversation id for groups/channels.
    UnreadCountUpdate {
        kind: ConversationKind,
        contact_id: i64,
        count: i64,
    },

    /// Presence edge transition, broadcast on the global presence group.
    StatusUpdate {
        user_id: i64,
        username: String,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    },

    Notification {
        title: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    Typing { user_id: i64, username: String },

    StopTyping { user_id: i64, username: String },

    MemberJoined { user: UserRef, role: Role },

    MemberLeft { user_id: i64, username: String },

    RoleUpdated {
        user_id: i64,
        username: String,
        new_role: Role,
    },

    CallJoined { user_id: i64, username: String },

    CallLeft { user_id: i64, username: String },

    /// Call invitation, delivered to the target's notification group.
    CallInvite {
        room_id: i64,
        from: UserRef,
        call_type: CallType,
    },

    /// SDP/ICE relayed across the call group; receivers filter on
    /// `target_user_id`.
    CallSignal {
        from_user_id: i64,
        target_user_id: i64,
        signal: CallSignalPayload,
    },

    /// Direct error reply; never broadcast.
    Error { message: String },
}
