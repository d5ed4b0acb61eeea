use std::net::SocketAddr;
use std::path::PathBuf;

use liveface_core::frame::DEFAULT_DESCRIPTOR_DIM;
use liveface_core::matcher::DEFAULT_MATCH_THRESHOLD;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on (default: 127.0.0.1:8080).
    pub listen_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which verify-face reports a match.
    pub match_threshold: f32,
    /// Length every registered and probed descriptor must have.
    pub descriptor_dim: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: default_data_dir().join("faces.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
        }
    }
}

impl Config {
    /// Load configuration from `LIVEFACED_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let listen_addr = std::env::var("LIVEFACED_LISTEN")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "ignoring invalid LIVEFACED_LISTEN");
                    None
                }
            })
            .unwrap_or(defaults.listen_addr);

        let db_path = std::env::var("LIVEFACED_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        Self {
            listen_addr,
            db_path,
            match_threshold: env_f32("LIVEFACED_MATCH_THRESHOLD", defaults.match_threshold),
            descriptor_dim: env_usize("LIVEFACED_DESCRIPTOR_DIM", defaults.descriptor_dim),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("liveface")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
