//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for downloaded attachments
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Link to the companion device
    #[arg(short, long, value_enum, default_value_t = TransportChoice::Ble, global = true)]
    pub transport: TransportChoice,

    /// Device id to connect to; defaults to the first candidate a scan finds
    #[arg(long, global = true)]
    pub device: Option<String>,
}

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportChoice {
    /// Bluetooth Low Energy
    Ble,
    /// In-memory demo phone
    Mock,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Scan for companion devices
    Scan,
    /// Connect to a device and report it
    Connect,
    /// Show the connection status
    Status,
    /// List conversations
    Conversations,
    /// Show the messages of one conversation
    Messages {
        /// Conversation id
        conversation: String,
    },
    /// Send a message
    Send {
        /// Conversation id
        conversation: String,
        /// Message text
        #[arg(default_value = "")]
        text: String,
        /// Files to attach
        #[arg(short, long)]
        attach: Vec<PathBuf>,
    },
    /// Download an attachment into the cache
    Download {
        /// Attachment id
        attachment: String,
    },
    /// Stay connected and print events until Ctrl+C
    Watch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_with_attachments() {
        let cli = Cli::try_parse_from([
            "usmessage",
            "--transport",
            "mock",
            "send",
            "conv-1",
            "hello there",
            "--attach",
            "a.jpg",
            "--attach",
            "b.mov",
        ])
        .unwrap();

        assert_eq!(cli.transport, TransportChoice::Mock);
        assert_eq!(
            cli.command,
            Commands::Send {
                conversation: "conv-1".into(),
                text: "hello there".into(),
                attach: vec![PathBuf::from("a.jpg"), PathBuf::from("b.mov")],
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["usmessage", "conversations", "-v", "--device", "dev-42"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.device.as_deref(), Some("dev-42"));
        assert_eq!(cli.transport, TransportChoice::Ble);
    }

    #[test]
    fn test_messages_requires_conversation() {
        assert!(Cli::try_parse_from(["usmessage", "messages"]).is_err());
    }
}
