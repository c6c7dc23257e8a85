//! Sync engine configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TransportKind;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Default ATT payload budget for a single BLE notification
pub const DEFAULT_MAX_CHUNK_PAYLOAD: usize = 244;

/// Name fragments that mark a device as a likely companion phone
pub const DEFAULT_DEVICE_KEYWORDS: &[&str] = &["phone", "ipad", "usmessage"];

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound for a single request/response exchange
    pub request_timeout: Duration,
    /// Upper bound for opening a channel to a device
    pub connect_timeout: Duration,
    /// How long a scan listens for advertisements
    pub scan_timeout: Duration,
    /// Maximum payload carried by one chunk of a large transfer
    pub max_chunk_payload: usize,
    /// Directory holding downloaded attachments
    pub attachment_dir: PathBuf,
    /// Case-insensitive name fragments used to classify discovered devices
    pub device_keywords: Vec<String>,
    /// Sender identifier the device uses for messages from this user
    pub self_sender_id: String,
    /// Transport used when connecting to an id no scan has reported
    pub default_transport: TransportKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(5),
            max_chunk_payload: DEFAULT_MAX_CHUNK_PAYLOAD,
            attachment_dir: std::env::temp_dir().join("usmessage").join("attachments"),
            device_keywords: DEFAULT_DEVICE_KEYWORDS
                .iter()
                .map(|keyword| keyword.to_string())
                .collect(),
            self_sender_id: "me".to_string(),
            default_transport: TransportKind::Bluetooth,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the maximum chunk payload
    pub fn with_max_chunk_payload(mut self, size: usize) -> Self {
        self.max_chunk_payload = size;
        self
    }

    /// Set attachment cache directory
    pub fn with_attachment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.attachment_dir = dir.into();
        self
    }

    /// Replace the device classification keywords
    pub fn with_device_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Sender id the phone uses for messages from this user
    pub fn with_self_sender_id(mut self, sender: impl Into<String>) -> Self {
        self.self_sender_id = sender.into();
        self
    }

    /// Transport used when connecting to an id no scan has reported
    pub fn with_default_transport(mut self, kind: TransportKind) -> Self {
        self.default_transport = kind;
        self
    }
}
