//! Wire protocol between the driver and a remote compute worker (spec §4.9,
//! §6).
//!
//! # Framing
//!
//! Each frame is `[4-byte LE length][2-byte LE method id][payload]`. The
//! payload is MessagePack (`rmp_serde`), matching the teacher's
//! driver/worker wire format; the method id lets a worker dispatch to a
//! handler without a full deserialize when it only needs to route, not
//! parse, a heavily loaded channel.
//!
//! # Authentication
//!
//! A 32-hex-character pre-shared key is sent immediately after connection
//! establishment, before any other frame. A key mismatch is a hard
//! disconnect (spec §6); there is no retry handshake.

use crate::assoc::{BlockArray, SlotKey};
use crate::block::BlockDefn;
use crate::control::Control;
use crate::error::RiosError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const AUTH_KEY_LEN: usize = 32;
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Method id for each message variant, carried in the frame header ahead
/// of the MessagePack payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MethodId {
    Init = 1,
    WorkBlock = 2,
    BlockResult = 3,
    WorkerError = 4,
    Shutdown = 5,
}

impl MethodId {
    fn from_u16(v: u16) -> Result<Self, RiosError> {
        Ok(match v {
            1 => MethodId::Init,
            2 => MethodId::WorkBlock,
            3 => MethodId::BlockResult,
            4 => MethodId::WorkerError,
            5 => MethodId::Shutdown,
            other => {
                return Err(RiosError::Ecs(format!("unknown method id {other}")));
            }
        })
    }
}

/// Sent once, right after authentication: everything a worker needs to
/// run the inner loop without re-reading the control object from disk
/// (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitMessage {
    pub control: Control,
    pub worker_id: usize,
    pub total_workers: usize,
}

/// One block of work dispatched to a remote worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkBlockMessage {
    pub block: BlockDefn,
    pub inputs: Vec<(SlotKey, BlockArray)>,
}

/// A completed block's output arrays, returned by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResultMessage {
    pub block: BlockDefn,
    pub outputs: Vec<(SlotKey, BlockArray)>,
    pub timer_snapshot: std::collections::BTreeMap<String, Vec<crate::timers::Interval>>,
}

/// An unrecoverable error raised by the user function on a remote worker
/// (spec §7 `WorkerException`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerErrorMessage {
    pub block: Option<BlockDefn>,
    pub exception_type: String,
    pub message: String,
    pub traceback: String,
}

/// One protocol message in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Init(InitMessage),
    WorkBlock(WorkBlockMessage),
    BlockResult(BlockResultMessage),
    WorkerError(WorkerErrorMessage),
    Shutdown,
}

impl Message {
    fn method_id(&self) -> MethodId {
        match self {
            Message::Init(_) => MethodId::Init,
            Message::WorkBlock(_) => MethodId::WorkBlock,
            Message::BlockResult(_) => MethodId::BlockResult,
            Message::WorkerError(_) => MethodId::WorkerError,
            Message::Shutdown => MethodId::Shutdown,
        }
    }
}

/// Serialize a message into a complete framed buffer:
/// `[len: u32 LE][method: u16 LE][payload]`.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, RiosError> {
    let payload = rmp_serde::to_vec(msg).map_err(|e| RiosError::Ecs(format!("encode failed: {e}")))?;
    let body_len = 2 + payload.len();
    let mut framed = Vec::with_capacity(4 + body_len);
    framed.extend_from_slice(&(body_len as u32).to_le_bytes());
    framed.extend_from_slice(&(msg.method_id() as u16).to_le_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

/// Decode a frame body (after the length prefix has already been read and
/// stripped), validating the method id matches the payload shape.
pub fn decode_frame(body: &[u8]) -> Result<Message, RiosError> {
    if body.len() < 2 {
        return Err(RiosError::Ecs("frame shorter than method id".to_string()));
    }
    let method = MethodId::from_u16(u16::from_le_bytes([body[0], body[1]]))?;
    let payload = &body[2..];
    let msg: Message = rmp_serde::from_slice(payload).map_err(|e| RiosError::Ecs(format!("decode failed: {e}")))?;
    if msg.method_id() != method {
        return Err(RiosError::Ecs("method id does not match payload variant".to_string()));
    }
    Ok(msg)
}

/// Write one framed message to the stream, flushing immediately.
pub async fn write_message(stream: &mut TcpStream, msg: &Message) -> Result<(), RiosError> {
    let framed = encode_frame(msg)?;
    stream.write_all(&framed).await.map_err(RiosError::from)?;
    stream.flush().await.map_err(RiosError::from)
}

/// Read one framed message from the stream.
pub async fn read_message(stream: &mut TcpStream) -> Result<Message, RiosError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(RiosError::from)?;
    let body_len = u32::from_le_bytes(len_buf) as usize;
    if body_len > MAX_FRAME_BYTES {
        return Err(RiosError::Ecs(format!("frame too large: {body_len} bytes")));
    }
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await.map_err(RiosError::from)?;
    decode_frame(&body)
}

/// Send the pre-shared authentication key as the very first bytes on a
/// freshly accepted connection.
pub async fn write_auth_key(stream: &mut TcpStream, key: &str) -> Result<(), RiosError> {
    assert_eq!(key.len(), AUTH_KEY_LEN, "auth key must be {AUTH_KEY_LEN} hex characters");
    stream.write_all(key.as_bytes()).await.map_err(RiosError::from)?;
    stream.flush().await.map_err(RiosError::from)
}

/// Read and validate the authentication key sent by a connecting worker.
/// A mismatch is reported to the caller, who disconnects; there is no
/// retry.
pub async fn read_and_check_auth_key(stream: &mut TcpStream, expected: &str) -> Result<(), RiosError> {
    let mut buf = [0u8; AUTH_KEY_LEN];
    stream.read_exact(&mut buf).await.map_err(RiosError::from)?;
    let received = std::str::from_utf8(&buf).map_err(|_| RiosError::Ecs("auth key is not valid utf-8".to_string()))?;
    if received != expected {
        return Err(RiosError::Ecs("authentication key mismatch".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_for_every_variant() {
        let messages = vec![
            Message::WorkBlock(WorkBlockMessage {
                block: BlockDefn::new(0, 0, 4, 4),
                inputs: vec![(SlotKey::single("in"), BlockArray::zeros(1, 4, 4))],
            }),
            Message::Shutdown,
            Message::WorkerError(WorkerErrorMessage {
                block: Some(BlockDefn::new(0, 0, 4, 4)),
                exception_type: "ValueError".to_string(),
                message: "boom".to_string(),
                traceback: "...".to_string(),
            }),
        ];
        for msg in messages {
            let framed = encode_frame(&msg).unwrap();
            let body_len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
            assert_eq!(body_len, framed.len() - 4);
            let decoded = decode_frame(&framed[4..]).unwrap();
            match (&msg, &decoded) {
                (Message::Shutdown, Message::Shutdown) => {}
                (Message::WorkBlock(a), Message::WorkBlock(b)) => assert_eq!(a.block, b.block),
                (Message::WorkerError(a), Message::WorkerError(b)) => assert_eq!(a.message, b.message),
                _ => panic!("variant mismatch after round trip"),
            }
        }
    }

    #[test]
    fn mismatched_method_id_is_rejected() {
        let msg = Message::Shutdown;
        let mut framed = encode_frame(&msg).unwrap();
        // corrupt the method id (bytes 4..6) to something else
        framed[4] = MethodId::Init as u16 as u8;
        let err = decode_frame(&framed[4..]);
        assert!(err.is_err());
    }
}
