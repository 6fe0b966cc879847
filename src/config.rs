//! Server configuration loaded from environment variables.

use std::path::PathBuf;

use crate::broadcast::DEFAULT_CAPACITY;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Database file (from ANNOTD_DB_PATH). `None` means the platform data directory.
    pub db_path: Option<PathBuf>,
    /// Directory holding uploaded files, named by file id (from ANNOTD_FILE_DIR).
    pub file_dir: PathBuf,
    /// Messages a broadcast subscriber may fall behind (from ANNOTD_BROADCAST_CAPACITY).
    pub broadcast_capacity: usize,
    /// Allowed CORS origins (from ANNOTD_CORS_ORIGINS, comma-separated).
    /// `None` allows any origin.
    pub cors_origins: Option<Vec<String>>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparseable values fall back to
    /// their defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = var("ANNOTD_DB_PATH").map(PathBuf::from);

        let file_dir = var("ANNOTD_FILE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("files"));

        let broadcast_capacity = match var("ANNOTD_BROADCAST_CAPACITY") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    tracing::warn!(value = %raw, "Invalid ANNOTD_BROADCAST_CAPACITY, using default");
                    DEFAULT_CAPACITY
                }
            },
            None => DEFAULT_CAPACITY,
        };

        let cors_origins = var("ANNOTD_CORS_ORIGINS")
            .map(|s| s.split(',').map(|s| s.trim().to_string()).collect());

        Self {
            db_path,
            file_dir,
            broadcast_capacity,
            cors_origins,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            file_dir: PathBuf::from("files"),
            broadcast_capacity: DEFAULT_CAPACITY,
            cors_origins: None,
        }
    }
}
