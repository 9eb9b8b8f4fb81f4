//! Per-user notification relay.
//!
//! Every session a user opens joins `notifications_{id}`, so a publish
//! here reaches all of their tabs at once. Publishing to a user with no
//! open sessions is a silent no-op.

use std::sync::Arc;

use chrono::Utc;

use parley_types::models::UserRef;
use parley_types::protocol::{CallType, ServerEvent};

use crate::fabric::{Fabric, notifications_group};

#[derive(Clone)]
pub struct NotificationRelay {
    fabric: Arc<dyn Fabric>,
}

impl NotificationRelay {
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self { fabric }
    }

    pub fn notify(&self, user_id: i64, event: &ServerEvent) {
        self.fabric.publish(&notifications_group(user_id), event);
    }

    /// New-message ping for direct rooms.
    pub fn message_ping(&self, user_id: i64, from: &UserRef) {
        self.notify(
            user_id,
            &ServerEvent::Notification {
                title: "New message".to_string(),
                message: format!("{} sent you a message", from.username),
                timestamp: Utc::now(),
            },
        );
    }

    /// New-file ping for direct rooms.
    pub fn file_ping(&self, user_id: i64, from: &UserRef) {
        self.notify(
            user_id,
            &ServerEvent::Notification {
                title: "New file".to_string(),
                message: format!("{} sent you a file", from.username),
                timestamp: Utc::now(),
            },
        );
    }

    /// Call invitation; carries a target identity, not a conversation.
    pub fn call_invite(&self, target_user_id: i64, room_id: i64, from: &UserRef, call_type: CallType) {
        self.notify(
            target_user_id,
            &ServerEvent::CallInvite {
                room_id,
                from: from.clone(),
                call_type,
            },
        );
    }
}
