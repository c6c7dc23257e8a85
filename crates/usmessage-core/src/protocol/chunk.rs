//! Chunked transfer framing for payloads larger than one notification
//!
//! A large response arrives as a sequence of frames on a single endpoint:
//!
//! - `0x01` Header: total payload length (u32, big-endian). Optional, at most
//!   once, and only before any data.
//! - `0x02` Data: sequence number (u32, big-endian, starting at 0) followed by
//!   at most `max_chunk_payload` bytes.
//! - `0x03` End: explicit terminal marker.
//!
//! The receiver appends data in arrival order and finishes only on End, so an
//! idle notification stream is never mistaken for completion.

use crate::errors::{Result, SyncError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

const TAG_HEADER: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_END: u8 = 0x03;

/// Upper bound on buffer space reserved from an untrusted length header
const MAX_RESERVE: usize = 64 * 1024;

/// Bytes of framing in front of a data chunk
pub const DATA_FRAME_OVERHEAD: usize = 5;

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// One frame of a chunked transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Header { total_len: u32 },
    Data { sequence: u32, payload: Vec<u8> },
    End,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Header { total_len } => {
                let mut bytes = Vec::with_capacity(5);
                bytes.push(TAG_HEADER);
                bytes.extend_from_slice(&total_len.to_be_bytes());
                bytes
            }
            Frame::Data { sequence, payload } => {
                let mut bytes = Vec::with_capacity(DATA_FRAME_OVERHEAD + payload.len());
                bytes.push(TAG_DATA);
                bytes.extend_from_slice(&sequence.to_be_bytes());
                bytes.extend_from_slice(payload);
                bytes
            }
            Frame::End => vec![TAG_END],
        }
    }

    /// Whether a transfer may begin with this frame
    pub fn starts_transfer(&self) -> bool {
        matches!(self, Frame::Header { .. } | Frame::Data { sequence: 0, .. })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (tag, rest) = bytes
            .split_first()
            .ok_or_else(|| SyncError::malformed("empty frame"))?;

        match *tag {
            TAG_HEADER => {
                let total_len = read_u32(rest, "header")?;
                if rest.len() != 4 {
                    return Err(SyncError::malformed("header frame has trailing bytes"));
                }
                Ok(Frame::Header { total_len })
            }
            TAG_DATA => {
                let sequence = read_u32(rest, "data")?;
                Ok(Frame::Data {
                    sequence,
                    payload: rest[4..].to_vec(),
                })
            }
            TAG_END => {
                if !rest.is_empty() {
                    return Err(SyncError::malformed("end frame has trailing bytes"));
                }
                Ok(Frame::End)
            }
            other => Err(SyncError::malformed(format!("unknown frame tag {:#04x}", other))),
        }
    }
}

fn read_u32(bytes: &[u8], frame: &str) -> Result<u32> {
    let field: [u8; 4] = bytes
        .get(..4)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| SyncError::malformed(format!("truncated {} frame", frame)))?;
    Ok(u32::from_be_bytes(field))
}

/// Split `payload` into frames carrying at most `max_chunk_payload` bytes each
pub fn split_into_frames(
    payload: &[u8],
    max_chunk_payload: usize,
    with_length_hint: bool,
) -> Vec<Frame> {
    let mut frames = Vec::new();
    if with_length_hint {
        frames.push(Frame::Header {
            total_len: u32::try_from(payload.len()).unwrap_or(u32::MAX),
        });
    }
    for (sequence, chunk) in payload.chunks(max_chunk_payload.max(1)).enumerate() {
        frames.push(Frame::Data {
            sequence: sequence as u32,
            payload: chunk.to_vec(),
        });
    }
    frames.push(Frame::End);
    frames
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

/// Receiver side of a chunked transfer
#[derive(Debug)]
pub struct ChunkAssembler {
    max_chunk_payload: usize,
    expected_len: Option<usize>,
    next_sequence: u32,
    buffer: Vec<u8>,
    complete: bool,
}

impl ChunkAssembler {
    pub fn new(max_chunk_payload: usize) -> Self {
        Self {
            max_chunk_payload,
            expected_len: None,
            next_sequence: 0,
            buffer: Vec::new(),
            complete: false,
        }
    }

    /// Decode and apply one raw notification
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        self.push(Frame::decode(bytes)?)
    }

    /// Apply one frame; returns the full payload once End is accepted
    pub fn push(&mut self, frame: Frame) -> Result<Option<Vec<u8>>> {
        if self.complete {
            return Err(SyncError::malformed("frame after end of transfer"));
        }

        match frame {
            Frame::Header { total_len } => {
                if self.expected_len.is_some() {
                    return Err(SyncError::malformed("duplicate length header"));
                }
                if self.next_sequence > 0 {
                    return Err(SyncError::malformed("length header after data"));
                }
                self.expected_len = Some(total_len as usize);
                self.buffer.reserve((total_len as usize).min(MAX_RESERVE));
                Ok(None)
            }
            Frame::Data { sequence, payload } => {
                if sequence != self.next_sequence {
                    return Err(SyncError::malformed(format!(
                        "chunk {} arrived, expected {}",
                        sequence, self.next_sequence
                    )));
                }
                if payload.len() > self.max_chunk_payload {
                    return Err(SyncError::malformed(format!(
                        "chunk of {} bytes exceeds limit {}",
                        payload.len(),
                        self.max_chunk_payload
                    )));
                }
                if let Some(expected) = self.expected_len {
                    if self.buffer.len() + payload.len() > expected {
                        return Err(SyncError::malformed(format!(
                            "transfer exceeds declared {} bytes",
                            expected
                        )));
                    }
                }
                self.buffer.extend_from_slice(&payload);
                self.next_sequence = self.next_sequence.wrapping_add(1);
                Ok(None)
            }
            Frame::End => {
                if let Some(expected) = self.expected_len {
                    if self.buffer.len() != expected {
                        return Err(SyncError::malformed(format!(
                            "end marker after {} of {} bytes",
                            self.buffer.len(),
                            expected
                        )));
                    }
                }
                self.complete = true;
                Ok(Some(std::mem::take(&mut self.buffer)))
            }
        }
    }

    /// Bytes received so far
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}
