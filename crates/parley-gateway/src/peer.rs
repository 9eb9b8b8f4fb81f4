//! Cross-process fan-out.
//!
//! `PeerFabric` wraps the in-process fabric with a TCP mesh between
//! server processes: every publish is delivered locally and forwarded to
//! each connected peer as a length-prefixed JSON frame; peers re-publish
//! into their own local fabric only, so frames never loop. Group
//! membership stays process-local; a group effectively spans every
//! process that has members in it.
//!
//! Handshake (client → server): `[0x00][len: u16 BE][secret bytes]`,
//! answered with `[0x00][0x01]` on success or `[0x00][0x00]` on reject.
//! Frames: `[len: u32 BE][json {"group": ..., "payload": ...}]`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_types::protocol::ServerEvent;

use crate::fabric::{Fabric, LocalFabric, SessionHandle};

/// Reconnect backoff for outbound peer links.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

const MAX_SECRET_SIZE: usize = 1024;

#[derive(Serialize, Deserialize)]
struct PeerFrame {
    group: String,
    payload: String,
}

pub struct PeerFabric {
    local: Arc<LocalFabric>,
    peers: RwLock<Vec<mpsc::UnboundedSender<Bytes>>>,
    secret: String,
}

impl PeerFabric {
    pub fn new(local: Arc<LocalFabric>, secret: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            local,
            peers: RwLock::new(Vec::new()),
            secret: secret.into(),
        })
    }

    /// Accept inbound peer links. Runs until the task is cancelled.
    pub fn listen(self: &Arc<Self>, listener: TcpListener) {
        let fabric = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("peer connection from {addr}");
                        let fabric = fabric.clone();
                        tokio::spawn(async move {
                            if let Err(e) = fabric.handle_inbound(stream).await {
                                warn!("peer connection error: {e:#}");
                            }
                        });
                    }
                    Err(e) => warn!("peer accept error: {e}"),
                }
            }
        });
    }

    /// Maintain an outbound link to one peer address, reconnecting with
    /// backoff. Frames published while the link is down are delivered
    /// after it comes back.
    pub fn connect(self: &Arc<Self>, addr: String) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        self.peers.write().expect("peer lock poisoned").push(tx);

        let secret = self.secret.clone();
        tokio::spawn(async move {
            loop {
                match open_link(&addr, &secret).await {
                    Ok(mut stream) => {
                        info!("peer link established to {addr}");
                        while let Some(frame) = rx.recv().await {
                            if stream.write_all(&frame).await.is_err() {
                                warn!("peer link to {addr} broke, reconnecting");
                                break;
                            }
                        }
                    }
                    Err(e) => debug!("peer link to {addr} failed: {e:#}"),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }

    async fn handle_inbound(&self, stream: TcpStream) -> anyhow::Result<()> {
        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        // Auth handshake: a shared secret instead of a per-user token,
        // since peers are trusted server processes.
        let marker = reader.read_u8().await?;
        if marker != 0x00 {
            writer.write_all(&[0x00, 0x00]).await?;
            return Ok(());
        }
        let secret_len = reader.read_u16().await? as usize;
        if secret_len == 0 || secret_len > MAX_SECRET_SIZE {
            writer.write_all(&[0x00, 0x00]).await?;
            return Ok(());
        }
        let mut secret_buf = vec![0u8; secret_len];
        reader.read_exact(&mut secret_buf).await?;
        if secret_buf != self.secret.as_bytes() {
            warn!("peer rejected: bad secret");
            writer.write_all(&[0x00, 0x00]).await?;
            return Ok(());
        }
        writer.write_all(&[0x00, 0x01]).await?;

        loop {
            let len = match reader.read_u32().await {
                Ok(len) => len as usize,
                Err(_) => break, // peer went away
            };
            if len == 0 || len > MAX_FRAME_SIZE {
                anyhow::bail!("peer frame of {len} bytes rejected");
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            let frame: PeerFrame = serde_json::from_slice(&buf)?;
            // Local delivery only: forwarding again would loop.
            self.local.publish_raw(&frame.group, &frame.payload);
        }
        Ok(())
    }

    fn forward(&self, group: &str, payload: &str) {
        let frame = PeerFrame {
            group: group.to_string(),
            payload: payload.to_string(),
        };
        let body = match serde_json::to_vec(&frame) {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to encode peer frame: {e}");
                return;
            }
        };
        let mut wire = Vec::with_capacity(4 + body.len());
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(&body);
        let wire = Bytes::from(wire);

        let peers = self.peers.read().expect("peer lock poisoned");
        for peer in peers.iter() {
            let _ = peer.send(wire.clone());
        }
    }
}

impl Fabric for PeerFabric {
    fn join(&self, group: &str, handle: SessionHandle) {
        self.local.join(group, handle);
    }

    fn leave(&self, group: &str, handle_id: u64) {
        self.local.leave(group, handle_id);
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
        self.local.publish_raw(group, payload);
        self.forward(group, payload);
    }
}

async fn open_link(addr: &str, secret: &str) -> anyhow::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    let sock_ref = socket2::SockRef::from(&stream);
    sock_ref.set_nodelay(true)?;

    let mut stream = stream;
    let mut hello = Vec::with_capacity(3 + secret.len());
    hello.push(0x00);
    hello.extend_from_slice(&(secret.len() as u16).to_be_bytes());
    hello.extend_from_slice(secret.as_bytes());
    stream.write_all(&hello).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x00, 0x01] {
        anyhow::bail!("peer refused handshake");
    }
    Ok(stream)
}
