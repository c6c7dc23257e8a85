//! usMessage device-sync engine
//!
//! Mirrors a companion phone's conversations and messages over a short-range
//! characteristic link. The crate is transport-agnostic: radio code lives in
//! `usmessage-ble`, which implements the [`transport::Transport`] and
//! [`transport::Channel`] traits defined here.
//!
//! ## Architecture
//!
//! - [`transport`] - Channel traits, per-endpoint request pipe, in-memory mock
//! - [`protocol`] - Request/response framing and chunked transfers
//! - [`connection`] - The single process-wide connection state machine
//! - [`coordinator`] - Discovery, device classification and connect routing
//! - [`cache`] - Conversation/message cache, optimistic sends, attachments
//! - [`events`] - Ordered event fan-out to collaborators
//! - [`context`] - Wires the pieces together once at start-up
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use usmessage_core::{transport::MockTransport, SyncConfig, SyncContext};
//!
//! # async fn example() -> usmessage_core::Result<()> {
//! let context = SyncContext::builder()
//!     .with_config(SyncConfig::default())
//!     .with_transport(Arc::new(MockTransport::demo()))
//!     .build();
//!
//! let devices = context.scan().await?;
//! context.connect(&devices[0].id).await?;
//! let conversations = context.fetch_conversations().await;
//! # let _ = conversations;
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use cache::{Snapshot, SnapshotSource, SyncCache};
pub use config::SyncConfig;
pub use connection::{ConnectionMachine, ConnectionState, LinkMonitor};
pub use context::{SyncContext, SyncContextBuilder};
pub use coordinator::{DeviceCoordinator, DeviceFilter, DeviceStatus};
pub use errors::{Result, SyncError};
pub use events::{EventBus, EventKind, ListenerHandle, Notification, Subscription, SyncEvent};
pub use types::{
    Attachment, AttachmentId, AttachmentKind, Conversation, ConversationId, DeliveryStatus,
    Device, DeviceId, Message, MessageId, Timestamp, TransportKind,
};
