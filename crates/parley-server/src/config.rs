use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Server configuration, read from the environment (with `.env` support
/// in main). Every knob has a development default except the peer mesh,
/// which is off unless configured.
pub struct Config {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub files_dir: PathBuf,
    pub base_url: String,
    pub history_limit: u32,
    pub peer_listen: Option<SocketAddr>,
    pub peers: Vec<String>,
    pub peer_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("PARLEY_PORT")
            .unwrap_or_else(|_| "8000".into())
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let jwt_secret =
            std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
        let db_path = PathBuf::from(
            std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into()),
        );
        let files_dir = PathBuf::from(
            std::env::var("PARLEY_FILES_DIR").unwrap_or_else(|_| "./uploads".into()),
        );
        let base_url =
            std::env::var("PARLEY_BASE_URL").unwrap_or_else(|_| format!("http://{host}:{port}"));
        let history_limit: u32 = std::env::var("PARLEY_HISTORY_LIMIT")
            .unwrap_or_else(|_| "50".into())
            .parse()
            .context("PARLEY_HISTORY_LIMIT must be a number")?;

        let peer_listen = match std::env::var("PARLEY_PEER_LISTEN") {
            Ok(addr) => Some(
                addr.parse()
                    .context("PARLEY_PEER_LISTEN must be host:port")?,
            ),
            Err(_) => None,
        };
        let peers = std::env::var("PARLEY_PEERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let peer_secret =
            std::env::var("PARLEY_PEER_SECRET").unwrap_or_else(|_| jwt_secret.clone());

        Ok(Self {
            host,
            port,
            jwt_secret,
            db_path,
            files_dir,
            base_url,
            history_limit,
            peer_listen,
            peers,
            peer_secret,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("invalid host/port")
    }

    pub fn peering_enabled(&self) -> bool {
        self.peer_listen.is_some() || !self.peers.is_empty()
    }
}
