//! CLI configuration file
//!
//! A TOML file with a `[sync]` table for the engine and a `[ble]` table for
//! the radio. Durations are plain milliseconds. Every key is optional.
//!
//! ```toml
//! [sync]
//! request_timeout_ms = 10000
//! device_keywords = ["phone", "ipad"]
//!
//! [ble]
//! scan_filter_by_service = true
//! write_mode = "with_response"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use usmessage_ble::{BleTransportConfig, GattLayout, WriteMode};
use usmessage_core::config::{DEFAULT_DEVICE_KEYWORDS, DEFAULT_MAX_CHUNK_PAYLOAD};
use usmessage_core::SyncConfig;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration Tables
// ----------------------------------------------------------------------------

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub scan_timeout_ms: u64,
    pub max_chunk_payload: usize,
    pub attachment_dir: Option<PathBuf>,
    pub device_keywords: Vec<String>,
    pub self_sender_id: String,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            scan_timeout_ms: 5_000,
            max_chunk_payload: DEFAULT_MAX_CHUNK_PAYLOAD,
            attachment_dir: None,
            device_keywords: DEFAULT_DEVICE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            self_sender_id: "me".to_string(),
        }
    }
}

/// Radio settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSection {
    pub scan_filter_by_service: bool,
    pub connection_timeout_ms: u64,
    pub write_mode: WriteMode,
    /// Override of the companion service UUID
    pub service_uuid: Option<Uuid>,
}

impl Default for BleSection {
    fn default() -> Self {
        Self {
            scan_filter_by_service: false,
            connection_timeout_ms: 10_000,
            write_mode: WriteMode::WithResponse,
            service_uuid: None,
        }
    }
}

/// Complete CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub sync: SyncSection,
    pub ble: BleSection,
}

impl CliConfig {
    /// Load `path` if given, else the default file if present, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => match Self::default_config_path() {
                Some(path) if path.is_file() => Self::load_from_file(&path),
                _ => {
                    info!("Using default configuration");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from: {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::FileSystem(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: CliConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/usmessage/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("usmessage").join("config.toml"))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::FileSystem(format!("Failed to create config directory: {}", e))
            })?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| ConfigError::FileSystem(format!("Failed to write config file: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("sync.request_timeout_ms", self.sync.request_timeout_ms),
            ("sync.connect_timeout_ms", self.sync.connect_timeout_ms),
            ("sync.scan_timeout_ms", self.sync.scan_timeout_ms),
            ("ble.connection_timeout_ms", self.ble.connection_timeout_ms),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be greater than 0", key)));
            }
        }
        if self.sync.max_chunk_payload == 0 {
            return Err(ConfigError::Validation(
                "sync.max_chunk_payload must be greater than 0".to_string(),
            ));
        }
        if self.sync.self_sender_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "sync.self_sender_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Engine configuration; `data_dir` overrides the attachment directory
    pub fn sync_config(&self, data_dir: Option<&Path>) -> SyncConfig {
        let mut config = SyncConfig::default()
            .with_request_timeout(Duration::from_millis(self.sync.request_timeout_ms))
            .with_connect_timeout(Duration::from_millis(self.sync.connect_timeout_ms))
            .with_scan_timeout(Duration::from_millis(self.sync.scan_timeout_ms))
            .with_max_chunk_payload(self.sync.max_chunk_payload)
            .with_device_keywords(self.sync.device_keywords.clone())
            .with_self_sender_id(self.sync.self_sender_id.clone());

        if let Some(dir) = data_dir
            .map(|dir| dir.join("attachments"))
            .or_else(|| self.sync.attachment_dir.clone())
        {
            config = config.with_attachment_dir(dir);
        }
        config
    }

    pub fn ble_config(&self) -> BleTransportConfig {
        let mut layout = GattLayout::default();
        if let Some(service) = self.ble.service_uuid {
            layout.service = service;
        }
        BleTransportConfig::new()
            .with_layout(layout)
            .with_scan_filter_by_service(self.ble.scan_filter_by_service)
            .with_connection_timeout(Duration::from_millis(self.ble.connection_timeout_ms))
            .with_write_mode(self.ble.write_mode)
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("TOML parsing error: {0}")]
    Parsing(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
