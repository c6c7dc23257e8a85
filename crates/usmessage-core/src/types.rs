//! Core data model for the device-sync engine
//!
//! Identifiers are string newtypes so a conversation id can never be passed
//! where a message id is expected. Conversation, message and attachment
//! records serialize in the camelCase shape the UI layer consumes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from any string-like value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque, transport-assigned device identifier
    DeviceId
);
string_id!(
    /// Conversation identifier assigned by the companion device
    ConversationId
);
string_id!(
    /// Message identifier; temporary (`temp-…`) for locally originated sends
    MessageId
);
string_id!(
    /// Attachment identifier assigned by the companion device
    AttachmentId
);

impl MessageId {
    const TEMPORARY_PREFIX: &'static str = "temp-";

    /// Synthesize a locally unique id for an optimistic send
    pub fn temporary() -> Self {
        Self(format!("{}{}", Self::TEMPORARY_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Whether this id was synthesized locally
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(Self::TEMPORARY_PREFIX)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Devices
// ----------------------------------------------------------------------------

/// Physical transport a device is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Bluetooth,
    Usb,
    Wifi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Usb => "usb",
            TransportKind::Wifi => "wifi",
        };
        f.write_str(name)
    }
}

/// A companion device as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Radio address when the platform exposes one
    pub address: Option<String>,
    pub transport: TransportKind,
    pub paired: bool,
    pub connected: bool,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
            transport,
            paired: false,
            connected: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Conversations
// ----------------------------------------------------------------------------

/// A conversation mirrored from the companion device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// Participant identifiers in device order
    pub participants: Vec<String>,
    pub display_name: String,
    pub is_group: bool,
    pub unread_count: u32,
    pub last_message: Option<Box<Message>>,
    pub avatar: Option<String>,
}

impl Conversation {
    /// Display name used when the device does not provide one
    pub fn derived_display_name(participants: &[String]) -> String {
        participants.join(", ")
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    pub timestamp: Timestamp,
    pub is_from_me: bool,
    pub status: DeliveryStatus,
    /// Canonical id issued by the device when it differs from `id`
    pub remote_id: Option<String>,
}

impl Message {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Short human-readable body for notifications and list previews
    pub fn preview(&self) -> String {
        match self.text.as_deref() {
            Some(text) if !text.is_empty() => text.to_string(),
            _ if self.has_attachments() => "Sent an attachment".to_string(),
            _ => String::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Attachments
// ----------------------------------------------------------------------------

/// Broad attachment category used for rendering decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            AttachmentKind::Image
        } else if mime_type.starts_with("video/") {
            AttachmentKind::Video
        } else {
            AttachmentKind::File
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::from_mime(mime_type_for_path(path))
    }
}

/// MIME type inferred from a file extension
pub fn mime_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Attachment metadata; bytes stay on the device until downloaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    pub kind: AttachmentKind,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub local_path: Option<PathBuf>,
    pub thumbnail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_ids_are_unique_and_tagged() {
        let a = MessageId::temporary();
        let b = MessageId::temporary();
        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert!(!MessageId::from("msg-1").is_temporary());
    }

    #[test]
    fn test_attachment_kind_from_mime_and_path() {
        assert_eq!(AttachmentKind::from_mime("image/png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("video/mp4"), AttachmentKind::Video);
        assert_eq!(AttachmentKind::from_mime("application/pdf"), AttachmentKind::File);

        assert_eq!(AttachmentKind::from_path(Path::new("a/B.JPG")), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_path(Path::new("clip.mov")), AttachmentKind::Video);
        assert_eq!(AttachmentKind::from_path(Path::new("notes")), AttachmentKind::File);
        assert_eq!(mime_type_for_path(Path::new("x.heic")), "image/heic");
    }

    #[test]
    fn test_message_preview() {
        let mut message = Message {
            id: MessageId::from("m1"),
            conversation_id: ConversationId::from("c1"),
            sender: "me".into(),
            text: None,
            attachments: Vec::new(),
            timestamp: Timestamp::from_millis(0),
            is_from_me: true,
            status: DeliveryStatus::Sent,
            remote_id: None,
        };
        assert_eq!(message.preview(), "");

        message.attachments.push(Attachment {
            id: AttachmentId::from("a1"),
            kind: AttachmentKind::Image,
            filename: "a.png".into(),
            mime_type: "image/png".into(),
            size: 3,
            local_path: None,
            thumbnail: None,
        });
        assert_eq!(message.preview(), "Sent an attachment");

        message.text = Some("hi".into());
        assert_eq!(message.preview(), "hi");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DeliveryStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
        let kind: TransportKind = serde_json::from_str("\"bluetooth\"").unwrap();
        assert_eq!(kind, TransportKind::Bluetooth);
    }
}
