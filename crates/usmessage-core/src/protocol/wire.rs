//! Request/response framing exchanged with the companion device
//!
//! Requests and responses are UTF-8 JSON documents. Decoding is strict: a
//! payload that does not parse into the expected shape is a
//! [`SyncError::MalformedTransfer`], never an empty result.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, SyncError};
use crate::types::{
    mime_type_for_path, Attachment, AttachmentId, AttachmentKind, Conversation, ConversationId,
    DeliveryStatus, Message, MessageId, Timestamp,
};

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

/// Operation requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    GetConversations,
    GetMessages,
    SendMessage,
    GetAttachment,
}

/// Attachment bytes shipped alongside an outgoing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    /// Base64 (standard alphabet) file content
    pub data: String,
}

impl AttachmentDescriptor {
    /// Build a descriptor from a file already read into memory
    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Self {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            filename,
            mime_type: mime_type_for_path(path).to_string(),
            size: bytes.len() as u64,
            data: STANDARD.encode(bytes),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| SyncError::malformed(format!("attachment data: {}", e)))
    }
}

/// A single request written to a device endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<AttachmentId>,
    /// Temporary id of an optimistic send, echoed back by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentDescriptor>,
}

impl Request {
    fn bare(action: Action) -> Self {
        Self {
            action,
            conversation_id: None,
            text: None,
            attachment_id: None,
            client_message_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn get_conversations() -> Self {
        Self::bare(Action::GetConversations)
    }

    pub fn get_messages(conversation_id: &ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id.clone()),
            ..Self::bare(Action::GetMessages)
        }
    }

    pub fn send_message(
        conversation_id: &ConversationId,
        client_message_id: &MessageId,
        text: &str,
        attachments: Vec<AttachmentDescriptor>,
    ) -> Self {
        Self {
            conversation_id: Some(conversation_id.clone()),
            text: Some(text.to_string()),
            client_message_id: Some(client_message_id.clone()),
            attachments,
            ..Self::bare(Action::SendMessage)
        }
    }

    pub fn get_attachment(attachment_id: &AttachmentId) -> Self {
        Self {
            attachment_id: Some(attachment_id.clone()),
            ..Self::bare(Action::GetAttachment)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::malformed(format!("encode request: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SyncError::malformed(format!("decode request: {}", e)))
    }
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

/// Device answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Successful response carrying `data`
    pub fn ok<T: Serialize>(data: &T) -> Result<Self> {
        let data = serde_json::to_value(data)
            .map_err(|e| SyncError::malformed(format!("encode response data: {}", e)))?;
        Ok(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    /// Failed response carrying a device-side reason
    pub fn err(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(reason.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SyncError::malformed(format!("encode response: {}", e)))
    }

    /// Strictly decode a response; an empty read is a protocol violation
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(SyncError::malformed("empty response"));
        }
        serde_json::from_slice(bytes)
            .map_err(|e| SyncError::malformed(format!("decode response: {}", e)))
    }

    /// Surface a device-side failure as [`SyncError::Rejected`]
    pub fn into_result(self) -> Result<Option<Value>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(SyncError::Rejected {
                reason: self.error.unwrap_or_else(|| "unspecified".to_string()),
            })
        }
    }

    /// Decode the data field into `T`, which must be present
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        match self.into_result()? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| SyncError::malformed(format!("decode response data: {}", e))),
            None => Err(SyncError::malformed("response has no data")),
        }
    }

    /// Decode the data field into `T` when present
    pub fn into_optional_data<T: DeserializeOwned>(self) -> Result<Option<T>> {
        match self.into_result()? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| SyncError::malformed(format!("decode response data: {}", e))),
        }
    }
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationsPayload {
    pub conversations: Vec<WireConversation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesPayload {
    pub messages: Vec<WireMessage>,
}

/// Data returned for a successful `send_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
}

// ----------------------------------------------------------------------------
// Wire Records
// ----------------------------------------------------------------------------

/// Conversation as the device reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConversation {
    pub id: ConversationId,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl WireConversation {
    /// Normalise into the cached representation
    pub fn into_conversation(self, self_sender: &str) -> Conversation {
        let display_name = match self.display_name {
            Some(name) if !name.is_empty() => name,
            _ => Conversation::derived_display_name(&self.participants),
        };
        let is_group = self.is_group || self.participants.len() > 1;
        let last_message = self
            .last_message
            .map(|message| Box::new(message.into_message(&self.id, self_sender)));

        Conversation {
            id: self.id,
            participants: self.participants,
            display_name,
            is_group,
            unread_count: self.unread_count,
            last_message,
            avatar: self.avatar,
        }
    }
}

/// Message as the device reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<WireAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_from_me: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
}

impl WireMessage {
    /// Normalise into the cached representation
    ///
    /// `conversation` is used when the record does not name its own
    /// conversation. Direction falls back to comparing the sender with
    /// `self_sender`, and a missing status means the device already holds it.
    pub fn into_message(self, conversation: &ConversationId, self_sender: &str) -> Message {
        let is_from_me = self.is_from_me.unwrap_or(self.sender == self_sender);

        Message {
            id: self.id,
            conversation_id: self.conversation_id.unwrap_or_else(|| conversation.clone()),
            sender: self.sender,
            text: self.text,
            attachments: self.attachments.into_iter().map(Attachment::from).collect(),
            timestamp: Timestamp::from_millis(self.timestamp),
            is_from_me,
            status: self.status.unwrap_or(DeliveryStatus::Delivered),
            remote_id: None,
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: Some(message.conversation_id.clone()),
            sender: message.sender.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp.as_millis(),
            attachments: message.attachments.iter().map(WireAttachment::from).collect(),
            is_from_me: Some(message.is_from_me),
            status: Some(message.status),
        }
    }
}

/// Attachment metadata as the device reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    pub id: AttachmentId,
    /// Declared MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl From<WireAttachment> for Attachment {
    fn from(wire: WireAttachment) -> Self {
        Attachment {
            kind: AttachmentKind::from_mime(&wire.mime_type),
            id: wire.id,
            filename: wire.filename,
            mime_type: wire.mime_type,
            size: wire.size,
            local_path: None,
            thumbnail: wire.thumbnail,
        }
    }
}

impl From<&Attachment> for WireAttachment {
    fn from(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id.clone(),
            mime_type: attachment.mime_type.clone(),
            filename: attachment.filename.clone(),
            size: attachment.size,
            thumbnail: attachment.thumbnail.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Push Notifications
// ----------------------------------------------------------------------------

/// Unsolicited update pushed on the notifications endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Push {
    /// A message arrived on the device
    MessageReceived { message: WireMessage },
    /// Delivery status of a known message changed
    #[serde(rename_all = "camelCase")]
    MessageStatus {
        message_id: MessageId,
        status: DeliveryStatus,
    },
}

impl Push {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::malformed(format!("encode push: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SyncError::malformed(format!("decode push: {}", e)))
    }
}
