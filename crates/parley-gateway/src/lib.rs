pub mod auth;
pub mod authority;
pub mod blobs;
pub mod bookkeeper;
pub mod call;
pub mod connection;
pub mod error;
pub mod fabric;
pub mod notify;
pub mod peer;
pub mod presence;
pub mod session;

use std::sync::Arc;

use parley_db::Database;

use crate::authority::MembershipAuthority;
use crate::blobs::BlobStore;
use crate::bookkeeper::Bookkeeper;
use crate::fabric::Fabric;
use crate::notify::NotificationRelay;
use crate::presence::PresenceTracker;

/// Everything a session needs, built once at startup and injected
/// explicitly. No module-global state, so tests can substitute an
/// in-process fabric and an in-memory database.
pub struct GatewayContext {
    pub db: Arc<Database>,
    pub fabric: Arc<dyn Fabric>,
    pub presence: PresenceTracker,
    pub authority: MembershipAuthority,
    pub bookkeeper: Bookkeeper,
    pub relay: NotificationRelay,
    pub blobs: BlobStore,
    pub history_limit: u32,
}

pub type Context = Arc<GatewayContext>;

impl GatewayContext {
    pub fn new(
        db: Arc<Database>,
        fabric: Arc<dyn Fabric>,
        blobs: BlobStore,
        history_limit: u32,
    ) -> Context {
        let relay = NotificationRelay::new(fabric.clone());
        Arc::new(GatewayContext {
            presence: PresenceTracker::new(db.clone(), fabric.clone()),
            authority: MembershipAuthority::new(db.clone(), fabric.clone()),
            bookkeeper: Bookkeeper::new(db.clone(), relay.clone()),
            relay,
            db,
            fabric,
            blobs,
            history_limit,
        })
    }
}

/// Run a persistence closure on the blocking pool so slow queries never
/// stall the event loop.
pub(crate) async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("blocking task join error: {e}"))?
}
