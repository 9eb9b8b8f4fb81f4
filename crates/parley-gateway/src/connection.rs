//! WebSocket actor plumbing shared by every endpoint family.
//!
//! Each accepted socket is split: a writer task owns the sink and drains
//! the connection's unbounded outbound queue, while the reader loop
//! dispatches inbound frames to the session one at a time. A heartbeat
//! pings every 15 seconds and drops the connection after two missed
//! pongs, so abrupt disconnects cannot leak group memberships.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_types::models::ConversationRef;
use parley_types::protocol::ServerEvent;

use crate::auth::Identity;
use crate::call::CallSession;
use crate::error::JoinRefusal;
use crate::fabric::{ConnectionSender, Outbound, PRESENCE_GROUP, SessionHandle, notifications_group};
use crate::session::ChatSession;
use crate::{Context, run_blocking};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

enum Actor<'a> {
    Chat(&'a ChatSession),
    Call(&'a CallSession),
    /// Notification and presence sockets are receive-only.
    Passive,
}

impl Actor<'_> {
    async fn on_text(&self, text: &str) {
        match self {
            Actor::Chat(session) => session.handle_text(text).await,
            Actor::Call(session) => session.handle_text(text).await,
            Actor::Passive => {}
        }
    }
}

/// Serve one conversation socket through its full lifecycle.
pub async fn serve_chat(
    socket: WebSocket,
    ctx: Context,
    conv: ConversationRef,
    identity: Identity,
) {
    let (handle, rx) = SessionHandle::channel();
    let session = match ChatSession::authorize(ctx.clone(), conv, identity, handle.clone()).await {
        Ok(session) => session,
        Err(refusal) => return refuse(socket, refusal).await,
    };

    let user = session.user().clone();
    info!(
        user = user.id,
        kind = ?conv.kind,
        conversation = conv.id,
        "chat session started"
    );

    ctx.presence.connected(&user).await;
    session.activate().await;

    run_socket(socket, rx, handle.tx.clone(), Actor::Chat(&session)).await;

    session.deactivate();
    ctx.presence.disconnected(&user).await;
    info!(user = user.id, conversation = conv.id, "chat session closed");
}

/// Serve the per-user notification socket.
pub async fn serve_notifications(socket: WebSocket, ctx: Context, identity: Identity) {
    let Some(user) = identity.user().cloned() else {
        return refuse(socket, JoinRefusal::Unauthenticated).await;
    };
    let (handle, rx) = SessionHandle::channel();

    ctx.fabric
        .join(&notifications_group(user.id), handle.clone());
    ctx.presence.connected(&user).await;
    debug!(user = user.id, "notification session started");

    run_socket(socket, rx, handle.tx.clone(), Actor::Passive).await;

    ctx.fabric.leave(&notifications_group(user.id), handle.id);
    ctx.presence.disconnected(&user).await;
}

/// Serve the global presence socket: joins the presence group and opens
/// with a snapshot of everyone currently online.
pub async fn serve_presence(socket: WebSocket, ctx: Context, identity: Identity) {
    let Some(user) = identity.user().cloned() else {
        return refuse(socket, JoinRefusal::Unauthenticated).await;
    };
    let (handle, rx) = SessionHandle::channel();

    ctx.fabric.join(PRESENCE_GROUP, handle.clone());
    ctx.presence.connected(&user).await;

    let db = ctx.db.clone();
    match run_blocking(move || db.online_users()).await {
        Ok(rows) => {
            for row in rows {
                handle.send_event(&ServerEvent::StatusUpdate {
                    user_id: row.id,
                    username: row.username,
                    is_online: true,
                    last_seen: None,
                });
            }
        }
        Err(e) => warn!("failed to load presence snapshot: {e:#}"),
    }

    run_socket(socket, rx, handle.tx.clone(), Actor::Passive).await;

    ctx.fabric.leave(PRESENCE_GROUP, handle.id);
    ctx.presence.disconnected(&user).await;
}

/// Serve one call-signaling socket.
pub async fn serve_call(socket: WebSocket, ctx: Context, room_id: i64, identity: Identity) {
    let (handle, rx) = SessionHandle::channel();
    let session = match CallSession::authorize(ctx.clone(), room_id, identity, handle.clone()).await
    {
        Ok(session) => session,
        Err(refusal) => return refuse(socket, refusal).await,
    };

    let user = session.user().clone();
    info!(user = user.id, room = room_id, "call session started");

    ctx.presence.connected(&user).await;
    session.activate();

    run_socket(socket, rx, handle.tx.clone(), Actor::Call(&session)).await;

    session.deactivate();
    ctx.presence.disconnected(&user).await;
    info!(user = user.id, room = room_id, "call session closed");
}

/// Close a never-accepted session with its refusal code.
async fn refuse(mut socket: WebSocket, refusal: JoinRefusal) {
    debug!(
        code = refusal.close_code(),
        "connection refused: {}",
        refusal.reason()
    );
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: refusal.close_code(),
            reason: refusal.reason().into(),
        })))
        .await;
}

/// The shared reader/writer loop. The writer task owns the sink; the
/// reader stays inline so inbound actions for one socket never overlap.
async fn run_socket(
    socket: WebSocket,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    tx: ConnectionSender,
    actor: Actor<'_>,
) {
    let (mut sink, mut stream) = socket.split();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                out = rx.recv() => {
                    let Some(out) = out else { break };
                    let msg = match out {
                        Outbound::Event(json) => Message::Text(json.into()),
                        Outbound::Ping(data) => Message::Ping(data.into()),
                        Outbound::Pong(data) => Message::Pong(data.into()),
                        Outbound::Close { code, reason } => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                    };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout, dropping connection");
                            break;
                        }
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => actor.on_text(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        debug!("ignoring binary frame on a JSON protocol socket");
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_received.store(true, Ordering::Release);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Outbound::Pong(data.to_vec()));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("socket receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    send_task.abort();
}
