//! Command-line front end for the usMessage device-sync engine
//!
//! Scans for the companion phone, connects over BLE (or an in-memory demo
//! phone), and reads or sends messages through a [`usmessage_core::SyncContext`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands, TransportChoice};
pub use commands::CommandDispatcher;
pub use config::{CliConfig, ConfigError};
pub use error::{CliError, Result};
