//! CLI error types

use thiserror::Error;
use usmessage_core::SyncError;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No companion device found; pass --device or move closer")]
    NoDevice,
}

pub type Result<T> = std::result::Result<T, CliError>;
