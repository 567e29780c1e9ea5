//! Binary wire protocol spoken over the collaboration WebSocket.
//!
//! Every frame starts with a one byte message type:
//!
//! | tag | message   | payload                                              |
//! |-----|-----------|------------------------------------------------------|
//! | `0` | sync      | sub-type byte (`0` step 1, `1` step 2, `2` update) + bytes |
//! | `1` | awareness | bytes (encoded awareness update)                      |
//! | `2` | auth      | bytes (opaque, handled before the room)               |
//!
//! Variable-length fields are prefixed with their length as unsigned LEB128.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

pub const MESSAGE_SYNC: u8 = 0;
pub const MESSAGE_AWARENESS: u8 = 1;
pub const MESSAGE_AUTH: u8 = 2;

pub const SYNC_STEP1: u8 = 0;
pub const SYNC_STEP2: u8 = 1;
pub const SYNC_UPDATE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector of the sender.
    Step1(Vec<u8>),
    /// Diff computed against a previously received state vector.
    Step2(Vec<u8>),
    /// Incremental diff produced by a local edit.
    Update(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabMessage {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    Auth(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Empty,
    UnknownMessageType(u8),
    UnknownSyncStep(u8),
    UnexpectedEnd,
    VarintOverflow,
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty message"),
            DecodeError::UnknownMessageType(t) => write!(f, "unknown message type {}", t),
            DecodeError::UnknownSyncStep(t) => write!(f, "unknown sync step {}", t),
            DecodeError::UnexpectedEnd => write!(f, "unexpected end of message"),
            DecodeError::VarintOverflow => write!(f, "varint does not fit in 64 bits"),
            DecodeError::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Append-only encoder for protocol fields.
#[derive(Debug, Default)]
pub struct BytesWriter {
    buf: Vec<u8>,
}

impl BytesWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub fn push_uleb128(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn push_var_bytes(&mut self, bytes: &[u8]) {
        self.push_uleb128(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_var_string(&mut self, s: &str) {
        self.push_var_bytes(s.as_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received frame.
#[derive(Debug)]
pub struct BytesReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BytesReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_uleb128(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            if shift >= 64 || (shift == 63 && byte > 1) {
                return Err(DecodeError::VarintOverflow);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = usize::try_from(self.read_uleb128()?).map_err(|_| DecodeError::UnexpectedEnd)?;
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_var_string(&mut self) -> Result<&'a str, DecodeError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl CollabMessage {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        CollabMessage::Sync(SyncMessage::Step1(state_vector))
    }

    pub fn sync_step2(diff: Vec<u8>) -> Self {
        CollabMessage::Sync(SyncMessage::Step2(diff))
    }

    pub fn sync_update(diff: Vec<u8>) -> Self {
        CollabMessage::Sync(SyncMessage::Update(diff))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BytesWriter::new();
        match self {
            CollabMessage::Sync(sync) => {
                w.push_byte(MESSAGE_SYNC);
                let (step, payload) = match sync {
                    SyncMessage::Step1(p) => (SYNC_STEP1, p),
                    SyncMessage::Step2(p) => (SYNC_STEP2, p),
                    SyncMessage::Update(p) => (SYNC_UPDATE, p),
                };
                w.push_byte(step);
                w.push_var_bytes(payload);
            }
            CollabMessage::Awareness(payload) => {
                w.push_byte(MESSAGE_AWARENESS);
                w.push_var_bytes(payload);
            }
            CollabMessage::Auth(payload) => {
                w.push_byte(MESSAGE_AUTH);
                w.push_var_bytes(payload);
            }
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut r = BytesReader::new(buf);
        match r.read_byte()? {
            MESSAGE_SYNC => {
                let step = r.read_byte()?;
                let payload = r.read_var_bytes()?.to_vec();
                match step {
                    SYNC_STEP1 => Ok(CollabMessage::Sync(SyncMessage::Step1(payload))),
                    SYNC_STEP2 => Ok(CollabMessage::Sync(SyncMessage::Step2(payload))),
                    SYNC_UPDATE => Ok(CollabMessage::Sync(SyncMessage::Update(payload))),
                    other => Err(DecodeError::UnknownSyncStep(other)),
                }
            }
            MESSAGE_AWARENESS => Ok(CollabMessage::Awareness(r.read_var_bytes()?.to_vec())),
            MESSAGE_AUTH => {
                // Auth frames may be empty; the payload is never interpreted here.
                if r.remaining() == 0 {
                    return Ok(CollabMessage::Auth(Vec::new()));
                }
                Ok(CollabMessage::Auth(r.read_var_bytes()?.to_vec()))
            }
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BroadcastKind {
    /// CRDT diff to merge.
    Update,
    /// Encoded awareness update.
    Awareness,
    /// State vector of an instance asking peers for missing operations.
    StateRequest,
}

/// Envelope published on a room's coordination channel.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomBroadcast {
    pub instance_id: String,
    pub kind: BroadcastKind,
    #[serde_as(as = "Bytes")]
    pub payload: Vec<u8>,
}

impl RoomBroadcast {
    pub fn new(instance_id: &str, kind: BroadcastKind, payload: Vec<u8>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            kind,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_cbor::Error> {
        serde_cbor::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_cbor::Error> {
        serde_cbor::from_slice(bytes)
    }
}
