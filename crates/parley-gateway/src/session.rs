//! Conversation session: the protocol state machine bound to one open
//! socket for one conversation.
//!
//! Lifecycle: CONNECTING → AUTHORIZED (non-anonymous identity) → ACTIVE
//! (membership verified, groups joined, history snapshot sent) → CLOSED.
//! Once active, actions are handled one at a time per socket; different
//! sockets run fully concurrently. Every handler persists before it
//! publishes, and failures become direct error replies, never
//! broadcasts and never a dead connection.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

use parley_db::models::{FileRow, MessageRow};
use parley_types::models::{
    ConversationKind, ConversationRef, FileKind, FilePayload, MessagePayload, MessageType,
    ReadPayload, Role, UserRef,
};
use parley_types::protocol::{ClientAction, ServerEvent, VALID_ACTIONS};

use crate::Context;
use crate::auth::Identity;
use crate::blobs::decode_file_payload;
use crate::error::{JoinRefusal, SessionError};
use crate::fabric::{SessionHandle, notifications_group};
use crate::run_blocking;

pub struct ChatSession {
    ctx: Context,
    conv: ConversationRef,
    user: UserRef,
    handle: SessionHandle,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("conv", &self.conv)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    /// CONNECTING → AUTHORIZED: requires a non-anonymous identity, a
    /// resolvable conversation, and membership in it. Each refusal maps
    /// to its own close code.
    pub async fn authorize(
        ctx: Context,
        conv: ConversationRef,
        identity: Identity,
        handle: SessionHandle,
    ) -> Result<Self, JoinRefusal> {
        let Some(user) = identity.user().cloned() else {
            return Err(JoinRefusal::Unauthenticated);
        };

        match ctx.authority.conversation_exists(conv).await {
            Ok(true) => {}
            Ok(false) => return Err(JoinRefusal::NotFound),
            Err(e) => {
                error!(conversation = conv.id, "existence check failed: {e:#}");
                return Err(JoinRefusal::Internal);
            }
        }

        match ctx.authority.is_member(conv, user.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(user = user.id, conversation = conv.id, "join refused: not a member");
                return Err(JoinRefusal::Forbidden);
            }
            Err(e) => {
                error!(conversation = conv.id, "membership check failed: {e:#}");
                return Err(JoinRefusal::Internal);
            }
        }

        Ok(Self {
            ctx,
            conv,
            user,
            handle,
        })
    }

    pub fn user(&self) -> &UserRef {
        &self.user
    }

    pub fn conversation(&self) -> ConversationRef {
        self.conv
    }

    /// AUTHORIZED → ACTIVE: join the conversation and notification
    /// groups, then send the history snapshot and the initial unread
    /// count as the opening payloads.
    pub async fn activate(&self) {
        self.ctx
            .fabric
            .join(&self.conv.group_name(), self.handle.clone());
        self.ctx
            .fabric
            .join(&notifications_group(self.user.id), self.handle.clone());

        if let Err(e) = self.send_history().await {
            warn!(user = self.user.id, "failed to send history snapshot: {e}");
        }
        match self.ctx.bookkeeper.unread_count(self.conv, self.user.id).await {
            Ok(count) => self.handle.send_event(&ServerEvent::UnreadCount { count }),
            Err(e) => warn!(user = self.user.id, "failed to compute unread count: {e:#}"),
        }
    }

    /// Leave all fan-out groups. Membership rows are untouched;
    /// disconnecting is not leaving a conversation.
    pub fn deactivate(&self) {
        self.ctx.fabric.leave(&self.conv.group_name(), self.handle.id);
        self.ctx
            .fabric
            .leave(&notifications_group(self.user.id), self.handle.id);
    }

    /// Parse and run one inbound frame. All expected failures convert to
    /// a direct error reply; unexpected ones are logged and collapse to a
    /// generic reply so a bad action never kills the session.
    pub async fn handle_text(&self, text: &str) {
        let action: ClientAction = match parse_envelope(text, VALID_ACTIONS) {
            Ok(action) => action,
            Err(message) => {
                self.reply_error(message);
                return;
            }
        };

        if let Err(e) = self.dispatch(action).await {
            if let SessionError::Transient(ref inner) = e {
                error!(
                    user = self.user.id,
                    kind = ?self.conv.kind,
                    conversation = self.conv.id,
                    "action failed: {inner:#}"
                );
            }
            self.reply_error(e.client_message());
        }
    }

    async fn dispatch(&self, action: ClientAction) -> Result<(), SessionError> {
        match action {
            ClientAction::Send { message, reply_to } => self.handle_send(message, reply_to).await,
            ClientAction::Edit {
                message_id,
                new_message,
            } => self.handle_edit(message_id, new_message).await,
            ClientAction::Delete { message_id } => self.handle_delete(message_id).await,
            ClientAction::Read { message_id } => self.handle_read(message_id).await,
            ClientAction::UploadFile {
                file_name,
                file_data,
            } => self.handle_upload(file_name, file_data).await,
            ClientAction::DeleteFile { file_id } => self.handle_delete_file(file_id).await,
            ClientAction::GetHistory => self.send_history().await,
            ClientAction::GetFiles => self.handle_get_files().await,
            ClientAction::GetUnreadCount => self.handle_get_unread().await,
            ClientAction::Typing => {
                self.publish(&ServerEvent::Typing {
                    user_id: self.user.id,
                    username: self.user.username.clone(),
                });
                Ok(())
            }
            ClientAction::StopTyping => {
                self.publish(&ServerEvent::StopTyping {
                    user_id: self.user.id,
                    username: self.user.username.clone(),
                });
                Ok(())
            }
        }
    }

    // -- handlers --

    async fn handle_send(&self, message: String, reply_to: Option<i64>) -> Result<(), SessionError> {
        let text = message.trim().to_string();
        if text.is_empty() {
            return Err(SessionError::invalid("message", "must not be empty"));
        }
        self.ensure_may_post().await?;

        if let Some(parent) = reply_to {
            if self.fetch_message(parent).await?.is_none() {
                return Err(SessionError::NotFound("reply_to message"));
            }
        }

        let db = self.ctx.db.clone();
        let conv = self.conv;
        let sender = self.user.id;
        let content = text.clone();
        let row = run_blocking(move || {
            let id = db.insert_message(conv, sender, Some(&content), None, reply_to, "text")?;
            db.get_message(conv, id)
        })
        .await?
        .ok_or_else(|| SessionError::Transient(anyhow::anyhow!("inserted message vanished")))?;

        let payload = self.payload_from_row(row, None, BTreeSet::new());
        self.publish(&ServerEvent::ChatMessage { message: payload });

        self.ctx.bookkeeper.push_recipients(self.conv, self.user.id).await;
        if self.conv.kind == ConversationKind::Room {
            if let Some(other) = self.other_participant().await? {
                self.ctx.relay.message_ping(other, &self.user);
            }
        }
        Ok(())
    }

    async fn handle_edit(&self, message_id: i64, new_message: String) -> Result<(), SessionError> {
        let text = new_message.trim().to_string();
        if text.is_empty() {
            return Err(SessionError::invalid("new_message", "must not be empty"));
        }
        self.ensure_member().await?;

        let row = self
            .fetch_message(message_id)
            .await?
            .ok_or(SessionError::NotFound("message"))?;
        if row.sender_id != self.user.id {
            debug!(user = self.user.id, message_id, "edit refused: not the author");
            return Err(SessionError::NotFound("message"));
        }

        if row.content.as_deref() == Some(text.as_str()) {
            // Unchanged text is still a success; re-broadcast so every
            // session converges on the same payload.
            let payload = self.hydrate(row).await?;
            self.publish(&ServerEvent::MessageUpdated { message: payload });
            return Ok(());
        }

        let db = self.ctx.db.clone();
        let conv = self.conv;
        let me = self.user.id;
        let content = text.clone();
        let changed =
            run_blocking(move || db.update_message_text(conv, message_id, me, &content)).await?;
        if changed == 0 {
            // Lost the race with a concurrent delete: delete wins.
            return Err(SessionError::NotFound("message"));
        }

        let row = self
            .fetch_message(message_id)
            .await?
            .ok_or(SessionError::NotFound("message"))?;
        let payload = self.hydrate(row).await?;
        self.publish(&ServerEvent::MessageUpdated { message: payload });
        self.ctx.bookkeeper.push_recipients(self.conv, self.user.id).await;
        Ok(())
    }

    async fn handle_delete(&self, message_id: i64) -> Result<(), SessionError> {
        self.ensure_member().await?;

        let row = self
            .fetch_message(message_id)
            .await?
            .ok_or(SessionError::NotFound("message"))?;

        // Channels let the owner moderate other people's messages.
        let owner_delete = self.conv.kind == ConversationKind::Channel
            && row.sender_id != self.user.id
            && self.ctx.authority.role_of(self.conv, self.user.id).await? == Some(Role::Owner);
        if row.sender_id != self.user.id && !owner_delete {
            debug!(user = self.user.id, message_id, "delete refused: not the author");
            return Err(SessionError::NotFound("message"));
        }

        let guard = if owner_delete { None } else { Some(self.user.id) };
        let db = self.ctx.db.clone();
        let conv = self.conv;
        let deleted = run_blocking(move || db.delete_message(conv, message_id, guard)).await?;
        let Some(file_id) = deleted else {
            return Err(SessionError::NotFound("message"));
        };

        if let Some(fid) = file_id {
            if let Err(e) = self.ctx.blobs.delete(fid).await {
                warn!(file_id = fid, "failed to delete blob: {e:#}");
            }
        }

        self.publish(&ServerEvent::MessageDeleted { message_id });
        self.ctx.bookkeeper.push_recipients(self.conv, self.user.id).await;
        Ok(())
    }

    async fn handle_read(&self, message_id: i64) -> Result<(), SessionError> {
        self.ensure_member().await?;

        let row = self
            .fetch_message(message_id)
            .await?
            .ok_or(SessionError::NotFound("message"))?;
        if row.sender_id == self.user.id {
            // Authors implicitly read their own messages; a benign no-op.
            return Ok(());
        }

        let db = self.ctx.db.clone();
        let conv = self.conv;
        let me = self.user.id;
        match conv.kind {
            ConversationKind::Room => {
                run_blocking(move || db.mark_room_message_read(conv, message_id)).await?;
            }
            _ => {
                run_blocking(move || db.add_read_mark(message_id, me).map(|_| ())).await?;
            }
        }

        self.publish(&ServerEvent::Read {
            message_id,
            user_id: self.user.id,
        });
        if let Err(e) = self.ctx.bookkeeper.push_one(self.conv, self.user.id).await {
            warn!(user = self.user.id, "failed to push unread count: {e:#}");
        }
        Ok(())
    }

    async fn handle_upload(&self, file_name: String, file_data: String) -> Result<(), SessionError> {
        let name = file_name.trim().to_string();
        if name.is_empty() {
            return Err(SessionError::invalid("file_name", "must not be empty"));
        }
        self.ensure_may_post().await?;

        let bytes = decode_file_payload(&file_data)
            .map_err(|e| SessionError::invalid("file_data", format!("not valid base64: {e}")))?;
        if bytes.is_empty() {
            return Err(SessionError::invalid("file_data", "must not be empty"));
        }
        let size = bytes.len() as i64;

        // Metadata row first so the blob can be keyed by its id.
        let db = self.ctx.db.clone();
        let conv = self.conv;
        let me = self.user.id;
        let fname = name.clone();
        let file_id = run_blocking(move || db.insert_file(me, conv, &fname, size)).await?;

        if let Err(e) = self.ctx.blobs.save(file_id, &bytes).await {
            // Roll the metadata back; nothing is published for a failed
            // upload.
            let db = self.ctx.db.clone();
            if let Err(e2) =
                run_blocking(move || db.delete_file_cascade(conv, file_id).map(|_| ())).await
            {
                warn!(file_id, "orphaned file row after failed save: {e2:#}");
            }
            return Err(SessionError::Transient(e));
        }

        let db = self.ctx.db.clone();
        let fname = name.clone();
        let row = run_blocking(move || {
            let mid = db.insert_message(conv, me, Some(&fname), Some(file_id), None, "file")?;
            db.get_message(conv, mid)
        })
        .await?
        .ok_or_else(|| SessionError::Transient(anyhow::anyhow!("inserted file message vanished")))?;

        let file = FilePayload {
            id: file_id,
            kind: FileKind::from_name(&name),
            url: self.ctx.blobs.url(file_id),
            name,
            size,
        };
        let payload = self.payload_from_row(row, Some(file.clone()), BTreeSet::new());
        self.publish(&ServerEvent::FileUploaded {
            message: payload,
            file,
        });

        self.ctx.bookkeeper.push_recipients(self.conv, self.user.id).await;
        if self.conv.kind == ConversationKind::Room {
            if let Some(other) = self.other_participant().await? {
                self.ctx.relay.file_ping(other, &self.user);
            }
        }
        Ok(())
    }

    async fn handle_delete_file(&self, file_id: i64) -> Result<(), SessionError> {
        self.ensure_member().await?;

        let db = self.ctx.db.clone();
        let conv = self.conv;
        let file = run_blocking(move || db.get_file(conv, file_id))
            .await?
            .ok_or(SessionError::NotFound("file"))?;

        let owner_delete = self.conv.kind == ConversationKind::Channel
            && file.uploader_id != self.user.id
            && self.ctx.authority.role_of(self.conv, self.user.id).await? == Some(Role::Owner);
        if file.uploader_id != self.user.id && !owner_delete {
            debug!(user = self.user.id, file_id, "file delete refused: not the uploader");
            return Err(SessionError::NotFound("file"));
        }

        let db = self.ctx.db.clone();
        let removed = run_blocking(move || db.delete_file_cascade(conv, file_id)).await?;
        let Some(message_id) = removed else {
            return Err(SessionError::NotFound("file"));
        };

        if let Err(e) = self.ctx.blobs.delete(file_id).await {
            warn!(file_id, "failed to delete blob: {e:#}");
        }

        self.publish(&ServerEvent::FileDeleted {
            file_id,
            message_id,
        });
        self.ctx.bookkeeper.push_recipients(self.conv, self.user.id).await;
        Ok(())
    }

    /// Direct reply only; history is never broadcast.
    async fn send_history(&self) -> Result<(), SessionError> {
        let db = self.ctx.db.clone();
        let conv = self.conv;
        let limit = self.ctx.history_limit;
        let (rows, reads, files) = run_blocking(move || {
            let rows = db.recent_messages(conv, limit)?;
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            let reads = if conv.kind == ConversationKind::Room {
                vec![]
            } else {
                db.read_marks(&ids)?
            };
            let mut files = Vec::new();
            for fid in rows.iter().filter_map(|r| r.file_id) {
                if let Some(f) = db.get_file_by_id(fid)? {
                    files.push(f);
                }
            }
            Ok((rows, reads, files))
        })
        .await?;

        let mut reads_by_message: HashMap<i64, BTreeSet<i64>> = HashMap::new();
        for (mid, uid) in reads {
            reads_by_message.entry(mid).or_default().insert(uid);
        }
        let mut files_by_id: HashMap<i64, FileRow> =
            files.into_iter().map(|f| (f.id, f)).collect();

        let messages = rows
            .into_iter()
            .map(|row| {
                let file = row
                    .file_id
                    .and_then(|fid| files_by_id.remove(&fid))
                    .map(|f| self.file_payload(f));
                let read_by = reads_by_message.remove(&row.id).unwrap_or_default();
                self.payload_from_row(row, file, read_by)
            })
            .collect();

        self.handle
            .send_event(&ServerEvent::MessageHistory { messages });
        Ok(())
    }

    async fn handle_get_files(&self) -> Result<(), SessionError> {
        let db = self.ctx.db.clone();
        let conv = self.conv;
        let rows = run_blocking(move || db.list_files(conv)).await?;
        let files = rows.into_iter().map(|f| self.file_payload(f)).collect();
        self.handle.send_event(&ServerEvent::FileList { files });
        Ok(())
    }

    async fn handle_get_unread(&self) -> Result<(), SessionError> {
        let count = self
            .ctx
            .bookkeeper
            .unread_count(self.conv, self.user.id)
            .await?;
        self.handle.send_event(&ServerEvent::UnreadCount { count });
        Ok(())
    }

    // -- plumbing --

    fn publish(&self, event: &ServerEvent) {
        self.ctx.fabric.publish(&self.conv.group_name(), event);
    }

    fn reply_error(&self, message: String) {
        self.handle.send_event(&ServerEvent::Error { message });
    }

    /// Membership is re-checked at action time, not just at join: a user
    /// removed mid-session loses write access immediately.
    async fn ensure_member(&self) -> Result<(), SessionError> {
        if self.ctx.authority.is_member(self.conv, self.user.id).await? {
            Ok(())
        } else {
            Err(SessionError::Forbidden("no longer a member of this conversation"))
        }
    }

    async fn ensure_may_post(&self) -> Result<(), SessionError> {
        self.ensure_member().await?;
        if self.conv.kind == ConversationKind::Channel
            && self.ctx.authority.role_of(self.conv, self.user.id).await? != Some(Role::Owner)
        {
            return Err(SessionError::Forbidden("only the channel owner may post"));
        }
        Ok(())
    }

    async fn fetch_message(&self, id: i64) -> Result<Option<MessageRow>, SessionError> {
        let db = self.ctx.db.clone();
        let conv = self.conv;
        Ok(run_blocking(move || db.get_message(conv, id)).await?)
    }

    async fn other_participant(&self) -> Result<Option<i64>, SessionError> {
        let db = self.ctx.db.clone();
        let room_id = self.conv.id;
        let me = self.user.id;
        Ok(run_blocking(move || Ok(db.get_room(room_id)?.map(|r| r.other(me)))).await?)
    }

    /// Fetch the file and read-mark context a bare row needs to become a
    /// full payload.
    async fn hydrate(&self, row: MessageRow) -> Result<MessagePayload, SessionError> {
        let db = self.ctx.db.clone();
        let file_id = row.file_id;
        let multi = self.conv.kind != ConversationKind::Room;
        let message_id = row.id;
        let (file, reads) = run_blocking(move || {
            let file = match file_id {
                Some(fid) => db.get_file_by_id(fid)?,
                None => None,
            };
            let reads = if multi {
                db.read_marks(&[message_id])?
            } else {
                vec![]
            };
            Ok((file, reads))
        })
        .await?;

        let read_by: BTreeSet<i64> = reads.into_iter().map(|(_, uid)| uid).collect();
        let file = file.map(|f| self.file_payload(f));
        Ok(self.payload_from_row(row, file, read_by))
    }

    fn payload_from_row(
        &self,
        row: MessageRow,
        file: Option<FilePayload>,
        read_by: BTreeSet<i64>,
    ) -> MessagePayload {
        let read = match self.conv.kind {
            ConversationKind::Room => ReadPayload::Single { is_read: row.is_read },
            _ => ReadPayload::Multi {
                read_by: read_by.into_iter().collect(),
            },
        };
        MessagePayload {
            id: row.id,
            sender: UserRef {
                id: row.sender_id,
                username: row.sender_username,
            },
            content: row.content,
            message_type: if row.message_type == "file" {
                MessageType::File
            } else {
                MessageType::Text
            },
            file,
            reply_to: row.reply_to,
            created_at: parse_timestamp(&row.created_at),
            edited: row.edited,
            read,
        }
    }

    fn file_payload(&self, row: FileRow) -> FilePayload {
        FilePayload {
            id: row.id,
            kind: FileKind::from_name(&row.name),
            url: self.ctx.blobs.url(row.id),
            name: row.name,
            size: row.size,
        }
    }
}

/// Parse an inbound `{ "action": ... }` envelope against a closed action
/// set. Unknown actions enumerate the valid ones; field errors name the
/// offending field via serde.
pub(crate) fn parse_envelope<T: DeserializeOwned>(
    text: &str,
    valid_actions: &[&str],
) -> Result<T, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|_| "invalid JSON payload".to_string())?;
    let Some(name) = value.get("action").and_then(Value::as_str) else {
        return Err(format!(
            "missing field `action`; valid actions are: {}",
            valid_actions.join(", ")
        ));
    };
    if !valid_actions.contains(&name) {
        return Err(format!(
            "unknown action `{name}`; valid actions are: {}",
            valid_actions.join(", ")
        ));
    }
    let name = name.to_string();
    serde_json::from_value(value).map_err(|e| format!("invalid {name} payload: {e}"))
}

/// SQLite stores `datetime('now')` without a timezone; fall back to
/// parsing it as naive UTC.
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("unparseable timestamp '{raw}': {e}");
            DateTime::default()
        })
}
