//! Presence tracking.
//!
//! Online state is derived from a per-user connection count, not from any
//! single socket: a user with two tabs open stays online until the last
//! one closes. Only the 0→1 and 1→0 edges persist state and broadcast a
//! status_update on the global presence group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::warn;

use parley_db::Database;
use parley_types::models::UserRef;
use parley_types::protocol::ServerEvent;

use crate::fabric::{Fabric, PRESENCE_GROUP};
use crate::run_blocking;

pub struct PresenceTracker {
    db: Arc<Database>,
    fabric: Arc<dyn Fabric>,
    counts: Mutex<HashMap<i64, u32>>,
}

impl PresenceTracker {
    pub fn new(db: Arc<Database>, fabric: Arc<dyn Fabric>) -> Self {
        Self {
            db,
            fabric,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Register one more live connection. Returns the new count; on the
    /// 0→1 edge the user flips online.
    pub async fn connected(&self, user: &UserRef) -> u32 {
        let count = {
            let mut counts = self.counts.lock().expect("presence lock poisoned");
            let entry = counts.entry(user.id).or_insert(0);
            *entry += 1;
            *entry
        };

        if count == 1 {
            let db = self.db.clone();
            let user_id = user.id;
            match run_blocking(move || db.set_online(user_id)).await {
                Ok(()) => self.fabric.publish(
                    PRESENCE_GROUP,
                    &ServerEvent::StatusUpdate {
                        user_id: user.id,
                        username: user.username.clone(),
                        is_online: true,
                        last_seen: None,
                    },
                ),
                // Publish only follows confirmed persistence.
                Err(e) => warn!(user_id = user.id, "failed to persist online state: {e}"),
            }
        }
        count
    }

    /// Drop one live connection. Returns the remaining count; on the 1→0
    /// edge the user flips offline and last_seen is stamped.
    pub async fn disconnected(&self, user: &UserRef) -> u32 {
        let count = {
            let mut counts = self.counts.lock().expect("presence lock poisoned");
            match counts.get_mut(&user.id) {
                Some(entry) => {
                    *entry = entry.saturating_sub(1);
                    let remaining = *entry;
                    if remaining == 0 {
                        counts.remove(&user.id);
                    }
                    remaining
                }
                None => return 0,
            }
        };

        if count == 0 {
            let now = Utc::now();
            let db = self.db.clone();
            let user_id = user.id;
            match run_blocking(move || db.set_offline(user_id)).await {
                Ok(()) => self.fabric.publish(
                    PRESENCE_GROUP,
                    &ServerEvent::StatusUpdate {
                        user_id: user.id,
                        username: user.username.clone(),
                        is_online: false,
                        last_seen: Some(now),
                    },
                ),
                Err(e) => warn!(user_id = user.id, "failed to persist offline state: {e}"),
            }
        }
        count
    }

    pub fn connection_count(&self, user_id: i64) -> u32 {
        self.counts
            .lock()
            .expect("presence lock poisoned")
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }
}
