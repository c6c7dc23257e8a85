//! Wire protocol spoken with the companion device

pub mod chunk;
pub mod wire;

pub use chunk::{split_into_frames, ChunkAssembler, Frame};
pub use wire::{
    Action, AttachmentDescriptor, ConversationsPayload, MessagesPayload, Push, Request, Response,
    SendReceipt, WireAttachment, WireConversation, WireMessage,
};
