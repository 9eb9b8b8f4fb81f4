//! Publish/subscribe fabric: named groups of live session handles.
//!
//! Groups are ephemeral: nothing is persisted, membership is rebuilt as
//! sockets reconnect. A handle that joins after a publish does not receive
//! it; history comes from the database instead. Within one group, events
//! published by one task arrive in the order they were issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::warn;

use parley_types::protocol::ServerEvent;

/// Frames queued to one connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized `ServerEvent`.
    Event(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

pub type ConnectionSender = mpsc::UnboundedSender<Outbound>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One live connection's address within the fabric.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub tx: ConnectionSender,
}

impl SessionHandle {
    pub fn new(tx: ConnectionSender) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Handle plus the receiving half of its outbound queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Direct reply to this connection only, bypassing any group.
    pub fn send_event(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.tx.send(Outbound::Event(json));
            }
            Err(e) => warn!("failed to serialize event: {e}"),
        }
    }
}

/// The broadcast substrate. Injected as `Arc<dyn Fabric>` everywhere so
/// tests run against the in-process implementation and deployments can
/// layer cross-process delivery on top.
pub trait Fabric: Send + Sync {
    fn join(&self, group: &str, handle: SessionHandle);
    fn leave(&self, group: &str, handle_id: u64);
    fn publish(&self, group: &str, event: &ServerEvent);
    /// Publish an already-serialized event (the peer bridge path).
    fn publish_raw(&self, group: &str, payload: &str);
}

pub const PRESENCE_GROUP: &str = "presence";

pub fn notifications_group(user_id: i64) -> String {
    format!("notifications_{user_id}")
}

pub fn call_group(room_id: i64) -> String {
    format!("call_{room_id}")
}

/// In-process fabric: a map from group name to current member handles.
/// Sufficient for a single server process and for tests.
#[derive(Default)]
pub struct LocalFabric {
    groups: RwLock<HashMap<String, Vec<SessionHandle>>>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live members, for diagnostics.
    pub fn group_size(&self, group: &str) -> usize {
        self.groups
            .read()
            .expect("fabric lock poisoned")
            .get(group)
            .map(|members| members.len())
            .unwrap_or(0)
    }
}

impl Fabric for LocalFabric {
    fn join(&self, group: &str, handle: SessionHandle) {
        let mut groups = self.groups.write().expect("fabric lock poisoned");
        groups.entry(group.to_string()).or_default().push(handle);
    }

    fn leave(&self, group: &str, handle_id: u64) {
        let mut groups = self.groups.write().expect("fabric lock poisoned");
        if let Some(members) = groups.get_mut(group) {
            members.retain(|h| h.id != handle_id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    fn publish(&self, group: &str, event: &ServerEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(group, "failed to serialize event: {e}");
                return;
            }
        };
        self.publish_raw(group, &payload);
    }

    fn publish_raw(&self, group: &str, payload: &str) {
        let groups = self.groups.read().expect("fabric lock poisoned");
        // Publishing to an absent group is a silent no-op.
        let Some(members) = groups.get(group) else {
            return;
        };
        for member in members {
            // A closed receiver means the connection is tearing down and
            // will leave the group itself.
            let _ = member.tx.send(Outbound::Event(payload.to_string()));
        }
    }
}
