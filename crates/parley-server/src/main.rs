mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, RawQuery, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_gateway::auth;
use parley_gateway::blobs::BlobStore;
use parley_gateway::connection;
use parley_gateway::fabric::{Fabric, LocalFabric};
use parley_gateway::peer::PeerFabric;
use parley_gateway::{Context, GatewayContext};
use parley_types::models::ConversationRef;

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    ctx: Context,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=info".into()),
        )
        .init();

    let cfg = Config::from_env()?;

    let db = Arc::new(parley_db::Database::open(&cfg.db_path)?);

    // One explicitly-constructed fabric instance wired into everything;
    // the peer mesh is layered on only when configured.
    let local = Arc::new(LocalFabric::new());
    let fabric: Arc<dyn Fabric> = if cfg.peering_enabled() {
        let peer = PeerFabric::new(local, cfg.peer_secret.clone());
        if let Some(listen) = cfg.peer_listen {
            let listener = tokio::net::TcpListener::bind(listen).await?;
            info!("peer mesh listening on {listen}");
            peer.listen(listener);
        }
        for addr in &cfg.peers {
            peer.connect(addr.clone());
        }
        peer
    } else {
        local
    };

    let blobs = BlobStore::new(cfg.files_dir.clone(), cfg.base_url.clone());
    blobs.init().await?;

    let ctx = GatewayContext::new(db, fabric, blobs, cfg.history_limit);
    let state = ServerState {
        ctx,
        jwt_secret: cfg.jwt_secret.clone(),
    };

    let app = Router::new()
        .route("/ws/chat/{room_id}", get(room_upgrade))
        .route("/ws/groups/{group_id}", get(group_upgrade))
        .route("/ws/channels/{channel_id}", get(channel_upgrade))
        .route("/ws/notifications", get(notifications_upgrade))
        .route("/ws/presence", get(presence_upgrade))
        .route("/ws/call/{room_id}", get(call_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = cfg.bind_addr()?;
    info!("Parley server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn room_upgrade(
    State(state): State<ServerState>,
    Path(room_id): Path<i64>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity =
        auth::authenticate(&state.ctx.db, &state.jwt_secret, &headers, query.as_deref()).await;
    ws.on_upgrade(move |socket| {
        connection::serve_chat(socket, state.ctx, ConversationRef::room(room_id), identity)
    })
}

async fn group_upgrade(
    State(state): State<ServerState>,
    Path(group_id): Path<i64>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity =
        auth::authenticate(&state.ctx.db, &state.jwt_secret, &headers, query.as_deref()).await;
    ws.on_upgrade(move |socket| {
        connection::serve_chat(socket, state.ctx, ConversationRef::group(group_id), identity)
    })
}

async fn channel_upgrade(
    State(state): State<ServerState>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity =
        auth::authenticate(&state.ctx.db, &state.jwt_secret, &headers, query.as_deref()).await;
    ws.on_upgrade(move |socket| {
        connection::serve_chat(
            socket,
            state.ctx,
            ConversationRef::channel(channel_id),
            identity,
        )
    })
}

async fn notifications_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity =
        auth::authenticate(&state.ctx.db, &state.jwt_secret, &headers, query.as_deref()).await;
    ws.on_upgrade(move |socket| connection::serve_notifications(socket, state.ctx, identity))
}

async fn presence_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity =
        auth::authenticate(&state.ctx.db, &state.jwt_secret, &headers, query.as_deref()).await;
    ws.on_upgrade(move |socket| connection::serve_presence(socket, state.ctx, identity))
}

async fn call_upgrade(
    State(state): State<ServerState>,
    Path(room_id): Path<i64>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity =
        auth::authenticate(&state.ctx.db, &state.jwt_secret, &headers, query.as_deref()).await;
    ws.on_upgrade(move |socket| connection::serve_call(socket, state.ctx, room_id, identity))
}
