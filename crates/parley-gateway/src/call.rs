//! Call-signaling session.
//!
//! One ephemeral group per room (`call_{room_id}`); SDP offers, answers
//! and ICE candidates are relayed across it tagged with from/target user
//! ids, and receivers filter on the target. Invitations go through the
//! notification relay because they address a user, not a conversation.
//! Nothing here is persisted.

use tracing::debug;

use parley_types::models::{ConversationRef, UserRef};
use parley_types::protocol::{CallAction, CallSignalPayload, ServerEvent, VALID_CALL_ACTIONS};

use crate::Context;
use crate::auth::Identity;
use crate::error::{JoinRefusal, SessionError};
use crate::fabric::{SessionHandle, call_group};
use crate::session::parse_envelope;

pub struct CallSession {
    ctx: Context,
    room_id: i64,
    user: UserRef,
    handle: SessionHandle,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("room_id", &self.room_id)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    /// Call sessions gate on membership of the underlying direct room.
    pub async fn authorize(
        ctx: Context,
        room_id: i64,
        identity: Identity,
        handle: SessionHandle,
    ) -> Result<Self, JoinRefusal> {
        let Some(user) = identity.user().cloned() else {
            return Err(JoinRefusal::Unauthenticated);
        };
        let room = ConversationRef::room(room_id);
        match ctx.authority.conversation_exists(room).await {
            Ok(true) => {}
            Ok(false) => return Err(JoinRefusal::NotFound),
            Err(_) => return Err(JoinRefusal::Internal),
        }
        match ctx.authority.is_member(room, user.id).await {
            Ok(true) => {}
            Ok(false) => return Err(JoinRefusal::Forbidden),
            Err(_) => return Err(JoinRefusal::Internal),
        }
        Ok(Self {
            ctx,
            room_id,
            user,
            handle,
        })
    }

    pub fn user(&self) -> &UserRef {
        &self.user
    }

    pub fn activate(&self) {
        self.ctx
            .fabric
            .join(&call_group(self.room_id), self.handle.clone());
    }

    pub fn deactivate(&self) {
        self.ctx
            .fabric
            .leave(&call_group(self.room_id), self.handle.id);
    }

    pub async fn handle_text(&self, text: &str) {
        let action: CallAction = match parse_envelope(text, VALID_CALL_ACTIONS) {
            Ok(action) => action,
            Err(message) => {
                self.handle.send_event(&ServerEvent::Error { message });
                return;
            }
        };

        if let Err(e) = self.dispatch(action).await {
            self.handle.send_event(&ServerEvent::Error {
                message: e.client_message(),
            });
        }
    }

    async fn dispatch(&self, action: CallAction) -> Result<(), SessionError> {
        match action {
            CallAction::JoinCall => {
                debug!(user = self.user.id, room = self.room_id, "joined call");
                self.publish(&ServerEvent::CallJoined {
                    user_id: self.user.id,
                    username: self.user.username.clone(),
                });
                Ok(())
            }
            CallAction::LeaveCall => {
                self.publish(&ServerEvent::CallLeft {
                    user_id: self.user.id,
                    username: self.user.username.clone(),
                });
                Ok(())
            }
            CallAction::Invite {
                target_user_id,
                call_type,
            } => {
                // Invitations only reach the other room participant.
                let room = ConversationRef::room(self.room_id);
                if !self.ctx.authority.is_member(room, target_user_id).await? {
                    return Err(SessionError::NotFound("target user"));
                }
                self.ctx
                    .relay
                    .call_invite(target_user_id, self.room_id, &self.user, call_type);
                Ok(())
            }
            CallAction::Offer {
                target_user_id,
                sdp,
            } => {
                self.relay_signal(target_user_id, CallSignalPayload::Offer { sdp });
                Ok(())
            }
            CallAction::Answer {
                target_user_id,
                sdp,
            } => {
                self.relay_signal(target_user_id, CallSignalPayload::Answer { sdp });
                Ok(())
            }
            CallAction::IceCandidate {
                target_user_id,
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                self.relay_signal(
                    target_user_id,
                    CallSignalPayload::IceCandidate {
                        candidate,
                        sdp_mid,
                        sdp_m_line_index,
                    },
                );
                Ok(())
            }
        }
    }

    fn relay_signal(&self, target_user_id: i64, signal: CallSignalPayload) {
        self.publish(&ServerEvent::CallSignal {
            from_user_id: self.user.id,
            target_user_id,
            signal,
        });
    }

    fn publish(&self, event: &ServerEvent) {
        self.ctx.fabric.publish(&call_group(self.room_id), event);
    }
}
