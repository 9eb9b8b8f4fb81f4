//! Unread-count bookkeeping.
//!
//! Counts are recomputed from the database after every mutation rather
//! than cached: deletes and multi-reader group semantics make incremental
//! counters drift, and an O(unread) count query is a price worth paying
//! for correctness. Fresh values are pushed through the notification
//! relay, addressed by a contact id: the other participant for rooms,
//! the conversation id for groups and channels.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use parley_db::Database;
use parley_types::models::{ConversationKind, ConversationRef};
use parley_types::protocol::ServerEvent;

use crate::notify::NotificationRelay;
use crate::run_blocking;

pub struct Bookkeeper {
    db: Arc<Database>,
    relay: NotificationRelay,
}

impl Bookkeeper {
    pub fn new(db: Arc<Database>, relay: NotificationRelay) -> Self {
        Self { db, relay }
    }

    pub async fn unread_count(&self, conv: ConversationRef, user_id: i64) -> Result<i64> {
        let db = self.db.clone();
        run_blocking(move || db.unread_count(conv, user_id)).await
    }

    /// Recompute and push the counter for one user.
    pub async fn push_one(&self, conv: ConversationRef, user_id: i64) -> Result<()> {
        let db = self.db.clone();
        let (count, contact_id) = run_blocking(move || {
            let count = db.unread_count(conv, user_id)?;
            let contact_id = match conv.kind {
                ConversationKind::Room => db
                    .get_room(conv.id)?
                    .map(|room| room.other(user_id))
                    .unwrap_or(conv.id),
                _ => conv.id,
            };
            Ok((count, contact_id))
        })
        .await?;

        self.relay.notify(
            user_id,
            &ServerEvent::UnreadCountUpdate {
                kind: conv.kind,
                contact_id,
                count,
            },
        );
        Ok(())
    }

    /// Recompute and push for every member except the acting user.
    /// Failures are logged per member; bookkeeping never fails an action
    /// that already committed.
    pub async fn push_recipients(&self, conv: ConversationRef, actor_id: i64) {
        let db = self.db.clone();
        let members = match run_blocking(move || db.member_ids(conv)).await {
            Ok(members) => members,
            Err(e) => {
                warn!(kind = ?conv.kind, conversation = conv.id, "failed to resolve recipients: {e}");
                return;
            }
        };

        for member in members.into_iter().filter(|id| *id != actor_id) {
            if let Err(e) = self.push_one(conv, member).await {
                warn!(member, "failed to push unread count: {e}");
            }
        }
    }
}
