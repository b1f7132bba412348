// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Framed host-protocol codec.
//!
//! Every message on the host socket is `[msgType:1][payloadLen:4 LE][payload]`.
//! The codec is stateless; structured payloads have dedicated encode/decode
//! helpers below. All integers are little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session_info::{ForegroundProcessInfo, SessionInfo};

/// Frame header size: one type byte plus a four-byte length.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single frame payload.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Host protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    GetInfo = 0x01,
    Info = 0x02,
    Input = 0x03,
    Resize = 0x04,
    ResizeAck = 0x05,
    GetBuffer = 0x06,
    Buffer = 0x07,
    SetName = 0x08,
    SetNameAck = 0x09,
    SetOrder = 0x0a,
    SetOrderAck = 0x0b,
    SetLogLevel = 0x0c,
    SetLogLevelAck = 0x0d,
    Close = 0x0e,
    CloseAck = 0x0f,
    Output = 0x10,
    StateChange = 0x11,
    ForegroundChange = 0x12,
}

impl MsgType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::GetInfo),
            0x02 => Some(Self::Info),
            0x03 => Some(Self::Input),
            0x04 => Some(Self::Resize),
            0x05 => Some(Self::ResizeAck),
            0x06 => Some(Self::GetBuffer),
            0x07 => Some(Self::Buffer),
            0x08 => Some(Self::SetName),
            0x09 => Some(Self::SetNameAck),
            0x0a => Some(Self::SetOrder),
            0x0b => Some(Self::SetOrderAck),
            0x0c => Some(Self::SetLogLevel),
            0x0d => Some(Self::SetLogLevelAck),
            0x0e => Some(Self::Close),
            0x0f => Some(Self::CloseAck),
            0x10 => Some(Self::Output),
            0x11 => Some(Self::StateChange),
            0x12 => Some(Self::ForegroundChange),
            _ => None,
        }
    }

    /// Ack type expected for a request, or `None` for server-initiated
    /// messages and `Input` (which is fire-and-forget).
    pub fn ack(&self) -> Option<MsgType> {
        match self {
            Self::GetInfo => Some(Self::Info),
            Self::Resize => Some(Self::ResizeAck),
            Self::GetBuffer => Some(Self::Buffer),
            Self::SetName => Some(Self::SetNameAck),
            Self::SetOrder => Some(Self::SetOrderAck),
            Self::SetLogLevel => Some(Self::SetLogLevelAck),
            Self::Close => Some(Self::CloseAck),
            _ => None,
        }
    }

    /// True for messages a server sends without a prior request.
    pub fn is_server_event(&self) -> bool {
        matches!(self, Self::Output | Self::StateChange | Self::ForegroundChange)
    }
}

/// Codec failures. Decode errors close the offending connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownType(u8),
    /// Declared payload length exceeds [`MAX_PAYLOAD`].
    Oversize(u32),
    /// Payload shorter than the structured encoding requires.
    Truncated { expected: usize, got: usize },
    /// Structured payload failed to parse.
    Payload(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(b) => write!(f, "unknown message type 0x{b:02x}"),
            Self::Oversize(len) => write!(f, "payload length {len} exceeds {MAX_PAYLOAD}"),
            Self::Truncated { expected, got } => {
                write!(f, "payload truncated: need {expected} bytes, got {got}")
            }
            Self::Payload(msg) => write!(f, "bad payload: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode a full frame: header plus payload, unchanged.
pub fn encode_frame(msg: MsgType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(msg as u8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Validate a frame header, returning the message type and payload length.
pub fn try_read_header(header: &[u8; HEADER_LEN]) -> Result<(MsgType, usize), DecodeError> {
    let msg = MsgType::from_u8(header[0]).ok_or(DecodeError::UnknownType(header[0]))?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    if len as usize > MAX_PAYLOAD {
        return Err(DecodeError::Oversize(len));
    }
    Ok((msg, len as usize))
}

// -- Structured payloads ------------------------------------------------------

/// `Output` payload: `[cols:2 LE][rows:2 LE][data...]`.
pub fn encode_output(cols: u16, rows: u16, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u16_le(cols);
    buf.put_u16_le(rows);
    buf.put_slice(data);
    buf.freeze()
}

pub fn decode_output(payload: &[u8]) -> Result<(u16, u16, Bytes), DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::Truncated { expected: 4, got: payload.len() });
    }
    let cols = u16::from_le_bytes([payload[0], payload[1]]);
    let rows = u16::from_le_bytes([payload[2], payload[3]]);
    Ok((cols, rows, Bytes::copy_from_slice(&payload[4..])))
}

/// `Resize` payload: `[cols:2 LE][rows:2 LE]`.
pub fn encode_resize(cols: u16, rows: u16) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf[..2].copy_from_slice(&cols.to_le_bytes());
    buf[2..].copy_from_slice(&rows.to_le_bytes());
    buf
}

pub fn decode_resize(payload: &[u8]) -> Result<(u16, u16), DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::Truncated { expected: 4, got: payload.len() });
    }
    Ok((
        u16::from_le_bytes([payload[0], payload[1]]),
        u16::from_le_bytes([payload[2], payload[3]]),
    ))
}

/// `SetName` payload: `[manual:1][utf8 name...]`. An empty name clears.
pub fn encode_set_name(name: Option<&str>, manual: bool) -> Bytes {
    let name = name.unwrap_or_default();
    let mut buf = BytesMut::with_capacity(1 + name.len());
    buf.put_u8(manual as u8);
    buf.put_slice(name.as_bytes());
    buf.freeze()
}

pub fn decode_set_name(payload: &[u8]) -> Result<(Option<String>, bool), DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Truncated { expected: 1, got: 0 });
    }
    let manual = payload[0] != 0;
    let name = std::str::from_utf8(&payload[1..])
        .map_err(|e| DecodeError::Payload(format!("name not utf-8: {e}")))?;
    let name = if name.is_empty() { None } else { Some(name.to_owned()) };
    Ok((name, manual))
}

/// `SetOrder` payload: a single byte.
pub fn decode_set_order(payload: &[u8]) -> Result<u8, DecodeError> {
    match payload.first() {
        Some(order) => Ok(*order),
        None => Err(DecodeError::Truncated { expected: 1, got: 0 }),
    }
}

/// `SetLogLevel` payload: utf8 level string ("trace".."error").
pub fn decode_set_log_level(payload: &[u8]) -> Result<String, DecodeError> {
    let level = std::str::from_utf8(payload)
        .map_err(|e| DecodeError::Payload(format!("level not utf-8: {e}")))?;
    Ok(level.to_owned())
}

/// `StateChange` payload: `[isRunning:1][hasExit:1][exitCode:4 LE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub is_running: bool,
    pub exit_code: Option<i32>,
}

pub fn encode_state_change(state: StateChange) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0] = state.is_running as u8;
    if let Some(code) = state.exit_code {
        buf[1] = 1;
        buf[2..].copy_from_slice(&code.to_le_bytes());
    }
    buf
}

pub fn decode_state_change(payload: &[u8]) -> Result<StateChange, DecodeError> {
    if payload.len() < 6 {
        return Err(DecodeError::Truncated { expected: 6, got: payload.len() });
    }
    let exit_code = if payload[1] != 0 {
        Some(i32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]))
    } else {
        None
    };
    Ok(StateChange { is_running: payload[0] != 0, exit_code })
}

/// `Info` payload: compact JSON encoding of [`SessionInfo`].
pub fn encode_info(info: &SessionInfo) -> Result<Bytes, DecodeError> {
    let json = serde_json::to_vec(info).map_err(|e| DecodeError::Payload(e.to_string()))?;
    Ok(Bytes::from(json))
}

pub fn decode_info(payload: &[u8]) -> Result<SessionInfo, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::Payload(e.to_string()))
}

/// `ForegroundChange` payload: compact JSON encoding of the process detail.
pub fn encode_foreground(info: &ForegroundProcessInfo) -> Result<Bytes, DecodeError> {
    let json = serde_json::to_vec(info).map_err(|e| DecodeError::Payload(e.to_string()))?;
    Ok(Bytes::from(json))
}

pub fn decode_foreground(payload: &[u8]) -> Result<ForegroundProcessInfo, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::Payload(e.to_string()))
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
