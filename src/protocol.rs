//! The worker wire protocol.
//!
//! Remote execution engines talk to their workers over a length-prefixed
//! message stream: one `u8` opcode, a `u32` big-endian payload length, then
//! the payload bytes. [`MessageParser`] buffers partial reads and emits
//! completed messages in arrival order.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::JobStatus;
use crate::error::ProtocolError;
use crate::hash::Hash;
use crate::thunk::{Thunk, ThunkOutput};

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Hey = 0x1,
    Put = 0x2,
    Get = 0x3,
    Ping = 0x4,
    Pong = 0x5,
    Execute = 0x6,
}

impl OpCode {
    fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x1 => Ok(OpCode::Hey),
            0x2 => Ok(OpCode::Put),
            0x3 => Ok(OpCode::Get),
            0x4 => Ok(OpCode::Ping),
            0x5 => Ok(OpCode::Pong),
            0x6 => Ok(OpCode::Execute),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: OpCode,
    payload: Bytes,
}

impl Message {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Frames a JSON-encoded payload.
    pub fn json<T: Serialize>(opcode: OpCode, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(opcode, serde_json::to_vec(payload)?))
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// The wire form: `opcode ‖ len ‖ payload`.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buffer.put_u8(self.opcode as u8);
        buffer.put_u32(self.payload.len() as u32);
        buffer.extend_from_slice(&self.payload);
        buffer.freeze()
    }
}

/// Incremental frame decoder over an arbitrary chunking of the stream.
#[derive(Debug, Default)]
pub struct MessageParser {
    buffer: BytesMut,
    completed: VecDeque<Message>,
}

impl MessageParser {
    /// Feeds one chunk; any messages completed by it become poppable, in
    /// arrival order.
    pub fn parse(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        self.buffer.extend_from_slice(chunk);

        loop {
            if self.buffer.len() < HEADER_LEN {
                return Ok(());
            }

            let opcode = OpCode::from_u8(self.buffer[0])?;
            let length = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;

            if self.buffer.len() < HEADER_LEN + length {
                return Ok(());
            }

            self.buffer.advance(HEADER_LEN);
            let payload = self.buffer.split_to(length).freeze();
            self.completed.push_back(Message { opcode, payload });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.completed.pop_front()
    }
}

/// Payload of an `Execute` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub hash: Hash,
    pub thunk: Thunk,
}

/// Payload of a worker's `Put` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WorkerReply {
    Done {
        hash: Hash,
        outputs: Vec<ThunkOutput>,
        cost: f64,
    },
    Failed {
        hash: Hash,
        status: JobStatus,
    },
}
