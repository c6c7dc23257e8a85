//! Id-indexed conversation and message storage
//!
//! Conversations merge by id. Messages live in an arena keyed by message id,
//! with each conversation holding an ordered list of ids. All updates are
//! replace-by-id on that index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::{AttachmentId, Conversation, ConversationId, DeliveryStatus, Message, MessageId};

// ----------------------------------------------------------------------------
// Conversations
// ----------------------------------------------------------------------------

/// Conversations in first-seen order, unique by id
#[derive(Debug, Default, Clone)]
pub struct ConversationStore {
    order: Vec<ConversationId>,
    entries: HashMap<ConversationId, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `conversations` by id; a known id is overwritten in place
    pub fn merge(&mut self, conversations: impl IntoIterator<Item = Conversation>) {
        for conversation in conversations {
            if !self.entries.contains_key(&conversation.id) {
                self.order.push(conversation.id.clone());
            }
            self.entries.insert(conversation.id.clone(), conversation);
        }
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.entries.get_mut(id)
    }

    pub fn list(&self) -> Vec<Conversation> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Point every cached copy of `attachment` at `path`
    pub fn set_attachment_path(&mut self, attachment: &AttachmentId, path: &Path) {
        for conversation in self.entries.values_mut() {
            if let Some(message) = conversation.last_message.as_deref_mut() {
                for entry in message.attachments.iter_mut().filter(|a| &a.id == attachment) {
                    entry.local_path = Some(path.to_path_buf());
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Message records indexed by message id and by conversation
#[derive(Debug, Default, Clone)]
pub struct MessageArena {
    records: HashMap<MessageId, Message>,
    threads: HashMap<ConversationId, Vec<MessageId>>,
}

impl MessageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.records.contains_key(id)
    }

    /// Find a message by its own id or by the canonical id the device issued
    pub fn resolve(&self, id: &MessageId) -> Option<&Message> {
        self.records.get(id).or_else(|| {
            self.records
                .values()
                .find(|message| message.remote_id.as_deref() == Some(id.as_str()))
        })
    }

    /// Ordered messages of one conversation
    pub fn thread(&self, conversation: &ConversationId) -> Vec<Message> {
        self.threads
            .get(conversation)
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// Append `message` to its conversation, or replace it if the id is known
    pub fn append(&mut self, message: Message) {
        let thread = self.threads.entry(message.conversation_id.clone()).or_default();
        if !thread.contains(&message.id) {
            thread.push(message.id.clone());
        }
        self.records.insert(message.id.clone(), message);
    }

    /// Replace a known message by id; returns false for unknown ids
    pub fn update(&mut self, message: Message) -> bool {
        match self.records.get_mut(&message.id) {
            Some(existing) => {
                *existing = message;
                true
            }
            None => false,
        }
    }

    /// Replace the record `incoming` refers to by its own or canonical id
    ///
    /// The stored record keeps its local id, thread and downloaded
    /// attachment paths. Returns `None` when no record matches.
    pub fn reconcile(&mut self, mut incoming: Message) -> Option<Message> {
        let local_id = self.resolve(&incoming.id)?.id.clone();
        let existing = self.records.get_mut(&local_id)?;

        if incoming.id != local_id {
            incoming.remote_id = Some(incoming.id.to_string());
            incoming.id = local_id;
        } else if incoming.remote_id.is_none() {
            incoming.remote_id = existing.remote_id.clone();
        }
        incoming.conversation_id = existing.conversation_id.clone();

        for (index, attachment) in incoming.attachments.iter_mut().enumerate() {
            if attachment.local_path.is_some() {
                continue;
            }
            attachment.local_path = existing
                .attachments
                .iter()
                .find(|known| known.id == attachment.id)
                .or_else(|| {
                    existing
                        .attachments
                        .get(index)
                        .filter(|known| known.filename == attachment.filename)
                })
                .and_then(|known| known.local_path.clone());
        }

        *existing = incoming.clone();
        Some(incoming)
    }

    /// Set the status of a known message, returning the updated record
    pub fn set_status(&mut self, id: &MessageId, status: DeliveryStatus) -> Option<Message> {
        let record = self.records.get_mut(id)?;
        record.status = status;
        Some(record.clone())
    }

    /// Replace a conversation's messages with a device snapshot
    ///
    /// Local sends still in flight or failed are not yet known to the
    /// device and stay at the end of the thread. A snapshot entry carrying
    /// the canonical id of a local send keeps the local id, and downloaded
    /// attachments keep their local path.
    pub fn replace_thread(&mut self, conversation: &ConversationId, snapshot: Vec<Message>) -> Vec<Message> {
        let previous = self.threads.remove(conversation).unwrap_or_default();

        let mut local_ids: HashMap<String, MessageId> = HashMap::new();
        let mut local_paths: HashMap<AttachmentId, PathBuf> = HashMap::new();
        let mut pending = Vec::new();
        for id in &previous {
            if let Some(message) = self.records.remove(id) {
                if let Some(remote) = &message.remote_id {
                    local_ids.insert(remote.clone(), message.id.clone());
                }
                for attachment in &message.attachments {
                    if let Some(path) = &attachment.local_path {
                        local_paths.insert(attachment.id.clone(), path.clone());
                    }
                }
                if matches!(message.status, DeliveryStatus::Sending | DeliveryStatus::Failed) {
                    pending.push(message);
                }
            }
        }

        let mut ids = Vec::with_capacity(snapshot.len() + pending.len());
        for mut message in snapshot {
            if let Some(local) = local_ids.get(message.id.as_str()) {
                message.remote_id = Some(message.id.to_string());
                message.id = local.clone();
            }
            message.conversation_id = conversation.clone();
            for attachment in message.attachments.iter_mut() {
                if attachment.local_path.is_none() {
                    attachment.local_path = local_paths.get(&attachment.id).cloned();
                }
            }
            if !ids.contains(&message.id) {
                ids.push(message.id.clone());
            }
            self.records.insert(message.id.clone(), message);
        }
        for message in pending {
            if !self.records.contains_key(&message.id) {
                ids.push(message.id.clone());
                self.records.insert(message.id.clone(), message);
            }
        }

        self.threads.insert(conversation.clone(), ids);
        self.thread(conversation)
    }

    /// Point every cached copy of `attachment` at `path`
    ///
    /// Returns the messages whose path changed.
    pub fn set_attachment_path(&mut self, attachment: &AttachmentId, path: &Path) -> Vec<Message> {
        let mut changed = Vec::new();
        for message in self.records.values_mut() {
            let mut touched = false;
            for entry in message.attachments.iter_mut().filter(|a| &a.id == attachment) {
                if entry.local_path.as_deref() != Some(path) {
                    entry.local_path = Some(path.to_path_buf());
                    touched = true;
                }
            }
            if touched {
                changed.push(message.clone());
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
