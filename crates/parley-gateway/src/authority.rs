//! Membership authority: who belongs to a conversation and with what
//! role, plus the membership mutations the external REST layer drives.
//!
//! Mutations persist first, then publish member_joined / member_left /
//! role_updated into the conversation group. Fan-out is an explicit step
//! here, never a hidden side effect of a data-layer write.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use parley_db::Database;
use parley_types::models::{ConversationKind, ConversationRef, Role, UserRef};
use parley_types::protocol::ServerEvent;

use crate::error::SessionError;
use crate::fabric::Fabric;
use crate::run_blocking;

pub struct MembershipAuthority {
    db: Arc<Database>,
    fabric: Arc<dyn Fabric>,
}

impl MembershipAuthority {
    pub fn new(db: Arc<Database>, fabric: Arc<dyn Fabric>) -> Self {
        Self { db, fabric }
    }

    pub async fn conversation_exists(&self, conv: ConversationRef) -> Result<bool> {
        let db = self.db.clone();
        run_blocking(move || db.conversation_exists(conv)).await
    }

    pub async fn is_member(&self, conv: ConversationRef, user_id: i64) -> Result<bool> {
        let db = self.db.clone();
        run_blocking(move || db.is_member(conv, user_id)).await
    }

    /// Role within a group/channel; rooms carry no roles.
    pub async fn role_of(&self, conv: ConversationRef, user_id: i64) -> Result<Option<Role>> {
        let db = self.db.clone();
        let role = run_blocking(move || db.membership_role(conv, user_id)).await?;
        Ok(role.as_deref().and_then(Role::parse))
    }

    /// Add a member. Idempotent: adding an existing member succeeds
    /// without publishing anything.
    pub async fn add_member(
        &self,
        conv: ConversationRef,
        actor_id: i64,
        target_id: i64,
        role: Role,
    ) -> Result<(), SessionError> {
        if conv.kind == ConversationKind::Room {
            return Err(SessionError::Forbidden(
                "direct rooms have a fixed pair of participants",
            ));
        }
        if role == Role::Owner {
            return Err(SessionError::Forbidden("a conversation has exactly one owner"));
        }
        self.require_manager(conv, actor_id).await?;

        let db = self.db.clone();
        let role_str = role.as_str();
        let added = run_blocking(move || db.add_membership(conv, target_id, role_str)).await?;
        if !added {
            return Ok(());
        }

        let user = self.user_ref(target_id).await?;
        self.fabric
            .publish(&conv.group_name(), &ServerEvent::MemberJoined { user, role });
        Ok(())
    }

    /// Remove a member. The owner can never be removed; members exit
    /// themselves only through `leave`.
    pub async fn remove_member(
        &self,
        conv: ConversationRef,
        actor_id: i64,
        target_id: i64,
    ) -> Result<(), SessionError> {
        if actor_id == target_id {
            return Err(SessionError::Forbidden("use leave to exit a conversation"));
        }
        let actor_role = self.require_manager(conv, actor_id).await?;

        let target_role = self
            .role_of(conv, target_id)
            .await?
            .ok_or(SessionError::NotFound("member"))?;
        match target_role {
            Role::Owner => {
                return Err(SessionError::Forbidden("the owner cannot be removed"));
            }
            Role::Admin if actor_role != Role::Owner => {
                return Err(SessionError::Forbidden("only the owner may remove admins"));
            }
            _ => {}
        }

        let db = self.db.clone();
        let removed = run_blocking(move || db.remove_membership(conv, target_id)).await?;
        if !removed {
            return Err(SessionError::NotFound("member"));
        }

        let user = self.user_ref(target_id).await?;
        self.fabric.publish(
            &conv.group_name(),
            &ServerEvent::MemberLeft {
                user_id: user.id,
                username: user.username,
            },
        );
        Ok(())
    }

    /// Change a member's role. Only the owner may grant roles; ownership
    /// itself is never reassigned here.
    pub async fn change_role(
        &self,
        conv: ConversationRef,
        actor_id: i64,
        target_id: i64,
        new_role: Role,
    ) -> Result<(), SessionError> {
        if conv.kind != ConversationKind::Group {
            return Err(SessionError::Forbidden("only groups have grantable roles"));
        }
        if new_role == Role::Owner {
            return Err(SessionError::Forbidden("ownership cannot be transferred"));
        }
        if !matches!(new_role, Role::Admin | Role::Member) {
            return Err(SessionError::Forbidden("role does not apply to groups"));
        }
        if actor_id == target_id {
            return Err(SessionError::Forbidden("cannot change your own role"));
        }
        if self.role_of(conv, actor_id).await? != Some(Role::Owner) {
            return Err(SessionError::Forbidden("only the owner may change roles"));
        }
        let target_role = self
            .role_of(conv, target_id)
            .await?
            .ok_or(SessionError::NotFound("member"))?;
        if target_role == Role::Owner {
            return Err(SessionError::Forbidden("the owner's role cannot be changed"));
        }

        let db = self.db.clone();
        let role_str = new_role.as_str();
        let changed =
            run_blocking(move || db.set_membership_role(conv, target_id, role_str)).await?;
        if !changed {
            return Err(SessionError::NotFound("member"));
        }

        let user = self.user_ref(target_id).await?;
        self.fabric.publish(
            &conv.group_name(),
            &ServerEvent::RoleUpdated {
                user_id: user.id,
                username: user.username,
                new_role,
            },
        );
        Ok(())
    }

    /// Voluntary exit, allowed for every role but owner.
    pub async fn leave(&self, conv: ConversationRef, user_id: i64) -> Result<(), SessionError> {
        if conv.kind == ConversationKind::Room {
            return Err(SessionError::Forbidden("direct rooms cannot be left"));
        }
        let role = self
            .role_of(conv, user_id)
            .await?
            .ok_or(SessionError::NotFound("membership"))?;
        if role == Role::Owner {
            return Err(SessionError::Forbidden("the owner cannot leave"));
        }

        let db = self.db.clone();
        let removed = run_blocking(move || db.remove_membership(conv, user_id)).await?;
        if !removed {
            return Err(SessionError::NotFound("membership"));
        }

        let user = self.user_ref(user_id).await?;
        self.fabric.publish(
            &conv.group_name(),
            &ServerEvent::MemberLeft {
                user_id: user.id,
                username: user.username,
            },
        );
        Ok(())
    }

    /// The role required to manage memberships: group owners and admins,
    /// channel owners.
    async fn require_manager(
        &self,
        conv: ConversationRef,
        actor_id: i64,
    ) -> Result<Role, SessionError> {
        let role = self.role_of(conv, actor_id).await?;
        let allowed = match conv.kind {
            ConversationKind::Group => matches!(role, Some(Role::Owner) | Some(Role::Admin)),
            ConversationKind::Channel => matches!(role, Some(Role::Owner)),
            ConversationKind::Room => false,
        };
        if allowed {
            Ok(role.expect("allowed implies a role"))
        } else {
            Err(SessionError::Forbidden(
                "not permitted to manage members of this conversation",
            ))
        }
    }

    async fn user_ref(&self, user_id: i64) -> Result<UserRef, SessionError> {
        let db = self.db.clone();
        let row = run_blocking(move || db.get_user(user_id)).await?;
        Ok(row
            .map(|u| UserRef {
                id: u.id,
                username: u.username,
            })
            .unwrap_or_else(|| {
                warn!(user_id, "membership references an unknown user");
                UserRef {
                    id: user_id,
                    username: "unknown".to_string(),
                }
            }))
    }
}
