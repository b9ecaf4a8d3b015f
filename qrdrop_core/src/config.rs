use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::transfer::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE};
use crate::transfer::sender::{TransferError, check_chunk_size};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "qrdrop";
const APP_NAME: &str = "qrdrop";
const CONFIG_FILE: &str = "config.json";

/// Overrides the directory holding `config.json`
pub const CONFIG_DIR_ENV: &str = "QRDROP_CONFIG_DIR";
/// Overrides `download_path`
pub const DOWNLOAD_DIR_ENV: &str = "QRDROP_DOWNLOAD_DIR";

/// Base of the share link; the session identifier becomes its fragment
pub const DEFAULT_SHARE_BASE_URL: &str = "qrdrop://connect";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid chunk_size: {0}")]
    ChunkSize(#[from] TransferError),
    #[error("Invalid share_base_url {url:?}")]
    ShareUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("max_file_size must be greater than zero")]
    MaxFileSize,
    #[error("Failed to write config to {path}")]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub download_path: PathBuf,
    /// Outgoing slice size in bytes
    pub chunk_size: usize,
    /// Largest incoming file accepted, in bytes
    pub max_file_size: u64,
    pub share_base_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        // ~/qrdrop on every platform
        let download_path = UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qrdrop");

        Self {
            download_path,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            share_base_url: DEFAULT_SHARE_BASE_URL.to_string(),
        }
    }
}

impl AppConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk (or defaults), then apply environment overrides
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = match Self::get_config_path() {
            Some(path) => Self::load_or_create(&path),
            None => Self::default(),
        };

        if let Ok(dir) = std::env::var(DOWNLOAD_DIR_ENV) {
            config.download_path = PathBuf::from(dir);
        }
        config
    }

    /// Load config from `path`, writing the defaults there on first run so
    /// the user has a file to edit
    pub fn load_or_create(path: &Path) -> Self {
        if path.exists() {
            return Self::load_from(path);
        }

        let config = Self::default();
        match config.save_to(path) {
            Ok(()) => info!("Wrote default config to {}", path.display()),
            Err(e) => warn!(error = ?e, "Could not write default config"),
        }
        config
    }

    /// Load config from a specific file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to a specific file, creating its directory if needed
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Save {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| io_err(e.into()))?;
        fs::write(path, json).map_err(io_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_chunk_size(self.chunk_size)?;
        if self.max_file_size == 0 {
            return Err(ConfigError::MaxFileSize);
        }
        url::Url::parse(&self.share_base_url).map_err(|source| ConfigError::ShareUrl {
            url: self.share_base_url.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}
