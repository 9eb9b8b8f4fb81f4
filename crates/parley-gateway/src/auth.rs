//! Connection authentication at socket upgrade time.
//!
//! Every failure path resolves to `Identity::Anonymous` rather than an
//! error: rejection policy lives in the sessions, which close anonymous
//! connections with a distinct code instead of accepting them.

use std::sync::Arc;

use axum::http::{HeaderMap, header};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use parley_db::Database;
use parley_types::api::Claims;
use parley_types::models::UserRef;

use crate::run_blocking;

#[derive(Debug, Clone)]
pub enum Identity {
    User(UserRef),
    Anonymous,
}

impl Identity {
    pub fn user(&self) -> Option<&UserRef> {
        match self {
            Identity::User(user) => Some(user),
            Identity::Anonymous => None,
        }
    }
}

/// Resolve the connection identity from the upgrade request. The bearer
/// token is taken from the Authorization header; the `token` query
/// parameter is the fallback for clients that cannot set headers on a
/// socket handshake. Header wins when both are present.
pub async fn authenticate(
    db: &Arc<Database>,
    jwt_secret: &str,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Identity {
    let Some(token) = bearer_token(headers, query) else {
        return Identity::Anonymous;
    };

    let token_data = match decode::<Claims>(
        &token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data,
        Err(e) => {
            debug!("token rejected: {e}");
            return Identity::Anonymous;
        }
    };

    let user_id = token_data.claims.sub;
    let db = db.clone();
    match run_blocking(move || db.get_user(user_id)).await {
        Ok(Some(user)) => Identity::User(UserRef {
            id: user.id,
            username: user.username,
        }),
        Ok(None) => {
            debug!(user_id, "token subject unknown");
            Identity::Anonymous
        }
        Err(e) => {
            debug!("identity lookup failed: {e}");
            Identity::Anonymous
        }
    }
}

fn bearer_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Some(token) = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return Some(token.to_string());
        }
    }

    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
