//! End-to-end session tests against an in-memory database and the
//! in-process fabric, exercising the same paths the WebSocket actor
//! drives in production.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc::UnboundedReceiver;

use parley_db::Database;
use parley_gateway::auth::Identity;
use parley_gateway::blobs::BlobStore;
use parley_gateway::error::JoinRefusal;
use parley_gateway::fabric::{Outbound, SessionHandle};
use parley_gateway::session::ChatSession;
use parley_gateway::{Context, GatewayContext};
use parley_gateway::fabric::LocalFabric;
use parley_types::models::{
    ConversationKind, ConversationRef, FileKind, MessagePayload, ReadPayload, Role, UserRef,
};
use parley_types::protocol::ServerEvent;

static TEST_SEQ: AtomicU32 = AtomicU32::new(0);

fn test_ctx() -> Context {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let fabric = Arc::new(LocalFabric::new());
    let dir = std::env::temp_dir().join(format!(
        "parley_gw_test_{}_{}",
        std::process::id(),
        TEST_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let blobs = BlobStore::new(dir, "http://localhost:8000");
    GatewayContext::new(db, fabric, blobs, 50)
}

fn make_user(ctx: &Context, name: &str) -> UserRef {
    let id = ctx.db.create_user(name).unwrap();
    UserRef {
        id,
        username: name.to_string(),
    }
}

async fn open_session(
    ctx: &Context,
    conv: ConversationRef,
    user: &UserRef,
) -> (ChatSession, UnboundedReceiver<Outbound>) {
    let (handle, rx) = SessionHandle::channel();
    let session = ChatSession::authorize(ctx.clone(), conv, Identity::User(user.clone()), handle)
        .await
        .expect("join should be allowed");
    session.activate().await;
    (session, rx)
}

fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(out) = rx.try_recv() {
        if let Outbound::Event(json) = out {
            events.push(serde_json::from_str(&json).unwrap());
        }
    }
    events
}

fn chat_messages(events: &[ServerEvent]) -> Vec<&MessagePayload> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ChatMessage { message } => Some(message),
            _ => None,
        })
        .collect()
}

fn errors(events: &[ServerEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Error { message } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn send_fans_out_to_both_room_sessions() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    let (_bela_session, mut bela_rx) = open_session(&ctx, conv, &bela).await;

    // opening snapshot: history then the initial unread count
    let opening = drain(&mut ana_rx);
    assert!(matches!(opening[0], ServerEvent::MessageHistory { .. }));
    assert!(matches!(opening[1], ServerEvent::UnreadCount { count: 0 }));
    drain(&mut bela_rx);

    ana_session
        .handle_text(r#"{"action":"send","message":"hi"}"#)
        .await;

    let ana_events = drain(&mut ana_rx);
    let bela_events = drain(&mut bela_rx);

    let sent = chat_messages(&ana_events)[0];
    let received = chat_messages(&bela_events)[0];
    assert_eq!(sent.id, received.id);
    assert_eq!(sent.content.as_deref(), Some("hi"));
    assert_eq!(sent.sender.id, ana.id);
    assert_eq!(sent.read, ReadPayload::Single { is_read: false });

    // bela's sessions share her notification group, so the unread delta
    // and the new-message ping land in the same queue
    assert!(bela_events.iter().any(|e| matches!(
        e,
        ServerEvent::UnreadCountUpdate {
            kind: ConversationKind::Room,
            contact_id,
            count: 1,
        } if *contact_id == ana.id
    )));
    assert!(
        bela_events
            .iter()
            .any(|e| matches!(e, ServerEvent::Notification { .. }))
    );
    // the sender gets no unread push for their own message
    assert!(
        !ana_events
            .iter()
            .any(|e| matches!(e, ServerEvent::UnreadCountUpdate { .. }))
    );

    assert_eq!(ctx.db.unread_count(conv, bela.id).unwrap(), 1);
    assert_eq!(ctx.db.unread_count(conv, ana.id).unwrap(), 0);
}

#[tokio::test]
async fn join_refusals_carry_distinct_causes() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let cato = make_user(&ctx, "cato");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (handle, _rx) = SessionHandle::channel();
    let refusal = ChatSession::authorize(ctx.clone(), conv, Identity::Anonymous, handle)
        .await
        .unwrap_err();
    assert_eq!(refusal, JoinRefusal::Unauthenticated);
    assert_eq!(refusal.close_code(), 4001);

    let (handle, _rx) = SessionHandle::channel();
    let refusal =
        ChatSession::authorize(ctx.clone(), conv, Identity::User(cato.clone()), handle)
            .await
            .unwrap_err();
    assert_eq!(refusal, JoinRefusal::Forbidden);
    assert_eq!(refusal.close_code(), 4003);

    let (handle, _rx) = SessionHandle::channel();
    let refusal = ChatSession::authorize(
        ctx.clone(),
        ConversationRef::room(9999),
        Identity::User(cato),
        handle,
    )
    .await
    .unwrap_err();
    assert_eq!(refusal, JoinRefusal::NotFound);
    assert_eq!(refusal.close_code(), 4004);
}

#[tokio::test]
async fn channel_posting_is_owner_gated() {
    let ctx = test_ctx();
    let owner = make_user(&ctx, "owner");
    let sub = make_user(&ctx, "sub");
    let cid = ctx.db.create_channel("news", None, owner.id).unwrap();
    let conv = ConversationRef::channel(cid);
    ctx.db.add_membership(conv, sub.id, "subscriber").unwrap();

    let (owner_session, mut owner_rx) = open_session(&ctx, conv, &owner).await;
    let (sub_session, mut sub_rx) = open_session(&ctx, conv, &sub).await;
    drain(&mut owner_rx);
    drain(&mut sub_rx);

    // a subscriber can neither post text nor upload
    sub_session
        .handle_text(r#"{"action":"send","message":"let me in"}"#)
        .await;
    sub_session
        .handle_text(r#"{"action":"upload_file","file_name":"x.txt","file_data":"aGk="}"#)
        .await;

    let sub_events = drain(&mut sub_rx);
    let errs = errors(&sub_events);
    assert_eq!(errs.len(), 2);
    assert!(errs.iter().all(|e| e.contains("channel owner")), "{errs:?}");

    // nothing was persisted, nothing reached the owner
    assert!(ctx.db.recent_messages(conv, 10).unwrap().is_empty());
    assert!(ctx.db.list_files(conv).unwrap().is_empty());
    assert!(drain(&mut owner_rx).is_empty());

    // the owner posts fine
    owner_session
        .handle_text(r#"{"action":"send","message":"launch day"}"#)
        .await;
    let sub_events = drain(&mut sub_rx);
    assert_eq!(
        chat_messages(&sub_events)[0].content.as_deref(),
        Some("launch day")
    );
}

#[tokio::test]
async fn upload_round_trip_preserves_size_and_kind() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    drain(&mut ana_rx);

    let bytes = b"pretend this is a png";
    let encoded = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    };
    let frame = format!(
        r#"{{"action":"upload_file","file_name":"shot.png","file_data":"data:image/png;base64,{encoded}"}}"#
    );
    ana_session.handle_text(&frame).await;

    let events = drain(&mut ana_rx);
    let (message, file) = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::FileUploaded { message, file } => Some((message, file)),
            _ => None,
        })
        .expect("upload should broadcast file_uploaded");

    assert_eq!(file.size, bytes.len() as i64);
    assert_eq!(file.kind, FileKind::Image);
    assert!(file.url.contains("/files/"));
    assert_eq!(message.file.as_ref().unwrap().id, file.id);

    // the blob actually landed on disk
    let on_disk = std::fs::read(ctx.blobs.path(file.id)).unwrap();
    assert_eq!(on_disk, bytes);

    // and history reports the same entry
    ana_session.handle_text(r#"{"action":"get_history"}"#).await;
    let events = drain(&mut ana_rx);
    let history = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageHistory { messages } => Some(messages),
            _ => None,
        })
        .unwrap();
    let entry = history[0].file.as_ref().unwrap();
    assert_eq!(entry.size, bytes.len() as i64);
    assert_eq!(entry.kind, FileKind::Image);
}

#[tokio::test]
async fn read_is_idempotent_and_self_reads_are_no_ops() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    let (bela_session, mut bela_rx) = open_session(&ctx, conv, &bela).await;
    drain(&mut ana_rx);
    drain(&mut bela_rx);

    ana_session
        .handle_text(r#"{"action":"send","message":"one"}"#)
        .await;
    ana_session
        .handle_text(r#"{"action":"send","message":"two"}"#)
        .await;
    let sent = drain(&mut ana_rx);
    let first_id = chat_messages(&sent)[0].id;
    drain(&mut bela_rx);
    assert_eq!(ctx.db.unread_count(conv, bela.id).unwrap(), 2);

    bela_session
        .handle_text(&format!(r#"{{"action":"read","message_id":{first_id}}}"#))
        .await;
    let events = drain(&mut bela_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Read { message_id, user_id } if *message_id == first_id && *user_id == bela.id
    )));
    // the reader's own unread counter is pushed to her notification group
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::UnreadCountUpdate { count: 1, .. }
    )));
    assert_eq!(ctx.db.unread_count(conv, bela.id).unwrap(), 1);

    // re-marking the same message is a successful no-op
    bela_session
        .handle_text(&format!(r#"{{"action":"read","message_id":{first_id}}}"#))
        .await;
    let events = drain(&mut bela_rx);
    assert!(errors(&events).is_empty());
    assert_eq!(ctx.db.unread_count(conv, bela.id).unwrap(), 1);

    // the author marking their own message is silently fine
    ana_session
        .handle_text(&format!(r#"{{"action":"read","message_id":{first_id}}}"#))
        .await;
    let events = drain(&mut ana_rx);
    assert!(errors(&events).is_empty());
    assert!(!events.iter().any(|e| matches!(e, ServerEvent::Read { .. })));
}

#[tokio::test]
async fn edit_and_delete_follow_ownership_and_race_rules() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    let (bela_session, mut bela_rx) = open_session(&ctx, conv, &bela).await;
    drain(&mut ana_rx);
    drain(&mut bela_rx);

    ana_session
        .handle_text(r#"{"action":"send","message":"draft"}"#)
        .await;
    let sent = drain(&mut ana_rx);
    let msg = chat_messages(&sent)[0].clone();
    drain(&mut bela_rx);

    // someone else's edit reads as not-found, not as a permission probe
    bela_session
        .handle_text(&format!(
            r#"{{"action":"edit","message_id":{},"new_message":"hijack"}}"#,
            msg.id
        ))
        .await;
    let events = drain(&mut bela_rx);
    assert!(errors(&events)[0].contains("not found"), "{events:?}");

    // the author's edit broadcasts and keeps the original timestamp
    ana_session
        .handle_text(&format!(
            r#"{{"action":"edit","message_id":{},"new_message":"final"}}"#,
            msg.id
        ))
        .await;
    let events = drain(&mut ana_rx);
    let updated = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageUpdated { message } => Some(message),
            _ => None,
        })
        .unwrap();
    assert_eq!(updated.content.as_deref(), Some("final"));
    assert!(updated.edited);
    assert_eq!(updated.created_at, msg.created_at);

    // an identical edit is still a success
    ana_session
        .handle_text(&format!(
            r#"{{"action":"edit","message_id":{},"new_message":"final"}}"#,
            msg.id
        ))
        .await;
    let events = drain(&mut ana_rx);
    assert!(errors(&events).is_empty());
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageUpdated { .. }))
    );

    // delete wins over any later edit or read
    ana_session
        .handle_text(&format!(r#"{{"action":"delete","message_id":{}}}"#, msg.id))
        .await;
    let events = drain(&mut ana_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageDeleted { message_id } if *message_id == msg.id
    )));

    ana_session
        .handle_text(&format!(
            r#"{{"action":"edit","message_id":{},"new_message":"ghost"}}"#,
            msg.id
        ))
        .await;
    let events = drain(&mut ana_rx);
    assert!(errors(&events)[0].contains("not found"));

    bela_session
        .handle_text(&format!(r#"{{"action":"read","message_id":{}}}"#, msg.id))
        .await;
    let events = drain(&mut bela_rx);
    assert!(errors(&events)[0].contains("not found"));
}

#[tokio::test]
async fn channel_owner_may_moderate_others_messages() {
    let ctx = test_ctx();
    let owner = make_user(&ctx, "owner");
    let cid = ctx.db.create_channel("news", None, owner.id).unwrap();
    let conv = ConversationRef::channel(cid);

    // seed a message attributed to a later-removed poster directly in the
    // store; only the owner is connected
    let ghost = make_user(&ctx, "ghost");
    ctx.db.add_membership(conv, ghost.id, "subscriber").unwrap();
    let mid = ctx
        .db
        .insert_message(conv, ghost.id, Some("spam"), None, None, "text")
        .unwrap();

    let (owner_session, mut owner_rx) = open_session(&ctx, conv, &owner).await;
    drain(&mut owner_rx);

    owner_session
        .handle_text(&format!(r#"{{"action":"delete","message_id":{mid}}}"#))
        .await;
    let events = drain(&mut owner_rx);
    assert!(errors(&events).is_empty(), "{events:?}");
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageDeleted { message_id } if *message_id == mid
    )));
    assert!(ctx.db.get_message(conv, mid).unwrap().is_none());
}

#[tokio::test]
async fn unknown_actions_reply_with_the_valid_set() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (session, mut rx) = open_session(&ctx, conv, &ana).await;
    drain(&mut rx);

    session.handle_text(r#"{"action":"explode"}"#).await;
    let events = drain(&mut rx);
    let err = errors(&events)[0];
    assert!(err.contains("unknown action `explode`"), "{err}");
    assert!(err.contains("send"), "{err}");

    session.handle_text("not json at all").await;
    let events = drain(&mut rx);
    assert!(errors(&events)[0].contains("invalid JSON"), "{events:?}");

    // a bad frame never kills the session
    session
        .handle_text(r#"{"action":"send","message":"still alive"}"#)
        .await;
    let events = drain(&mut rx);
    assert_eq!(chat_messages(&events).len(), 1);
}

#[tokio::test]
async fn group_reads_are_tracked_per_member() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let cato = make_user(&ctx, "cato");
    let gid = ctx.db.create_group("trio", None, ana.id).unwrap();
    let conv = ConversationRef::group(gid);
    ctx.db.add_membership(conv, bela.id, "member").unwrap();
    ctx.db.add_membership(conv, cato.id, "member").unwrap();

    let (ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    let (bela_session, mut bela_rx) = open_session(&ctx, conv, &bela).await;
    drain(&mut ana_rx);
    drain(&mut bela_rx);

    ana_session
        .handle_text(r#"{"action":"send","message":"meeting at noon"}"#)
        .await;
    let sent = drain(&mut ana_rx);
    let mid = chat_messages(&sent)[0].id;
    drain(&mut bela_rx);

    bela_session
        .handle_text(&format!(r#"{{"action":"read","message_id":{mid}}}"#))
        .await;
    drain(&mut bela_rx);

    // bela has read it, cato has not
    assert_eq!(ctx.db.unread_count(conv, bela.id).unwrap(), 0);
    assert_eq!(ctx.db.unread_count(conv, cato.id).unwrap(), 1);

    // history exposes the reader set
    bela_session.handle_text(r#"{"action":"get_history"}"#).await;
    let events = drain(&mut bela_rx);
    let history = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageHistory { messages } => Some(messages),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        history[0].read,
        ReadPayload::Multi {
            read_by: vec![bela.id]
        }
    );
}

#[tokio::test]
async fn membership_mutations_enforce_owner_protection() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let cato = make_user(&ctx, "cato");
    let gid = ctx.db.create_group("trio", None, ana.id).unwrap();
    let conv = ConversationRef::group(gid);

    let (_ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    drain(&mut ana_rx);

    // the owner invites; the group hears about it
    ctx.authority
        .add_member(conv, ana.id, bela.id, Role::Member)
        .await
        .unwrap();
    let events = drain(&mut ana_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::MemberJoined { user, role: Role::Member } if user.id == bela.id
    )));

    // a plain member cannot invite
    let err = ctx
        .authority
        .add_member(conv, bela.id, cato.id, Role::Member)
        .await
        .unwrap_err();
    assert!(err.client_message().contains("not permitted"));

    // nobody removes the owner, and the owner cannot leave
    let err = ctx
        .authority
        .remove_member(conv, bela.id, ana.id)
        .await
        .unwrap_err();
    assert!(err.client_message().contains("not permitted"));
    let err = ctx.authority.leave(conv, ana.id).await.unwrap_err();
    assert!(err.client_message().contains("owner"));

    // role grants broadcast
    ctx.authority
        .change_role(conv, ana.id, bela.id, Role::Admin)
        .await
        .unwrap();
    let events = drain(&mut ana_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::RoleUpdated { user_id, new_role: Role::Admin, .. } if *user_id == bela.id
    )));

    // a non-owner may leave
    ctx.authority.leave(conv, bela.id).await.unwrap();
    assert!(!ctx.db.is_member(conv, bela.id).unwrap());
    let events = drain(&mut ana_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::MemberLeft { user_id, .. } if *user_id == bela.id
    )));
}

#[tokio::test]
async fn removed_member_loses_write_access_mid_session() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let gid = ctx.db.create_group("duo", None, ana.id).unwrap();
    let conv = ConversationRef::group(gid);
    ctx.db.add_membership(conv, bela.id, "member").unwrap();

    let (bela_session, mut bela_rx) = open_session(&ctx, conv, &bela).await;
    drain(&mut bela_rx);

    // kicked while connected: the membership check at action time catches it
    ctx.authority.remove_member(conv, ana.id, bela.id).await.unwrap();

    bela_session
        .handle_text(r#"{"action":"send","message":"still here?"}"#)
        .await;
    let events = drain(&mut bela_rx);
    assert!(errors(&events)[0].contains("no longer a member"), "{events:?}");
    assert!(ctx.db.recent_messages(conv, 10).unwrap().is_empty());
}

#[tokio::test]
async fn typing_events_reach_the_conversation_group() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    let (_bela_session, mut bela_rx) = open_session(&ctx, conv, &bela).await;
    drain(&mut ana_rx);
    drain(&mut bela_rx);

    ana_session.handle_text(r#"{"action":"typing"}"#).await;
    ana_session.handle_text(r#"{"action":"stop_typing"}"#).await;

    let events = drain(&mut bela_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Typing { user_id, .. } if *user_id == ana.id
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::StopTyping { user_id, .. } if *user_id == ana.id
    )));
}

#[tokio::test]
async fn deleting_a_file_removes_its_carrier_message() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (ana_session, mut ana_rx) = open_session(&ctx, conv, &ana).await;
    drain(&mut ana_rx);

    ana_session
        .handle_text(r#"{"action":"upload_file","file_name":"notes.txt","file_data":"aGVsbG8="}"#)
        .await;
    let events = drain(&mut ana_rx);
    let file_id = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::FileUploaded { file, .. } => Some(file.id),
            _ => None,
        })
        .unwrap();

    ana_session
        .handle_text(&format!(r#"{{"action":"delete_file","file_id":{file_id}}}"#))
        .await;
    let events = drain(&mut ana_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::FileDeleted { file_id: fid, message_id: Some(_) } if *fid == file_id
    )));

    assert!(ctx.db.list_files(conv).unwrap().is_empty());
    assert!(ctx.db.recent_messages(conv, 10).unwrap().is_empty());
    assert!(!ctx.blobs.path(file_id).exists());
}

#[tokio::test]
async fn get_files_lists_the_conversation_library() {
    let ctx = test_ctx();
    let ana = make_user(&ctx, "ana");
    let bela = make_user(&ctx, "bela");
    let room = ctx.db.get_or_create_room(ana.id, bela.id).unwrap();
    let conv = ConversationRef::room(room.id);

    let (session, mut rx) = open_session(&ctx, conv, &ana).await;
    drain(&mut rx);

    session
        .handle_text(r#"{"action":"upload_file","file_name":"a.pdf","file_data":"aGVsbG8="}"#)
        .await;
    session
        .handle_text(r#"{"action":"upload_file","file_name":"b.zip","file_data":"d29ybGQ="}"#)
        .await;
    drain(&mut rx);

    session.handle_text(r#"{"action":"get_files"}"#).await;
    let events = drain(&mut rx);
    let files = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::FileList { files } => Some(files),
            _ => None,
        })
        .unwrap();
    assert_eq!(files.len(), 2);
    let kinds: Vec<FileKind> = files.iter().map(|f| f.kind).collect();
    assert!(kinds.contains(&FileKind::Pdf));
    assert!(kinds.contains(&FileKind::Archive));
}
