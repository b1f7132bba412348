// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Browser-facing multiplex frame codec.
//!
//! Every frame is `[type:1][sessionId:8 ASCII][payload]`. The codec is
//! byte-exact and versioned independently of the host protocol: browsers
//! update on a different cadence than hosts.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Session ids are always exactly eight ASCII bytes.
pub const SESSION_ID_LEN: usize = 8;

/// Mux frames never exceed this size; output is chunked to fit.
pub const MAX_FRAME: usize = 64 * 1024;

/// Byte offset of the full client id inside an Init frame.
pub const INIT_CLIENT_ID_OFFSET: usize = 9;

/// Length of a mux client id (32 hex chars).
pub const CLIENT_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxFrameType {
    Output = 0x01,
    Input = 0x02,
    Resize = 0x03,
    /// Server-only greeting carrying the client id.
    Init = 0xff,
}

impl MuxFrameType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Output),
            0x02 => Some(Self::Input),
            0x03 => Some(Self::Resize),
            0xff => Some(Self::Init),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCodecError {
    /// Frame shorter than the type byte plus session id.
    TooShort(usize),
    UnknownType(u8),
    /// Session or client id is not the required ASCII shape.
    BadId,
    /// Encoded frame would exceed [`MAX_FRAME`].
    Oversize(usize),
}

impl fmt::Display for MuxCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "frame too short: {len} bytes"),
            Self::UnknownType(b) => write!(f, "unknown frame type 0x{b:02x}"),
            Self::BadId => f.write_str("malformed session or client id"),
            Self::Oversize(len) => write!(f, "frame of {len} bytes exceeds {MAX_FRAME}"),
        }
    }
}

impl std::error::Error for MuxCodecError {}

/// A parsed inbound frame, borrowing the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct MuxFrame<'a> {
    pub kind: MuxFrameType,
    pub session_id: &'a str,
    pub payload: &'a [u8],
}

fn check_session_id(id: &str) -> Result<(), MuxCodecError> {
    if id.len() != SESSION_ID_LEN || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MuxCodecError::BadId);
    }
    Ok(())
}

/// Build one Output frame. `data` must already fit the frame budget; use
/// [`output_frames`] for arbitrary chunks.
pub fn output_frame(
    session_id: &str,
    cols: u16,
    rows: u16,
    data: &[u8],
) -> Result<Bytes, MuxCodecError> {
    check_session_id(session_id)?;
    let total = 1 + SESSION_ID_LEN + 4 + data.len();
    if total > MAX_FRAME {
        return Err(MuxCodecError::Oversize(total));
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(MuxFrameType::Output as u8);
    buf.put_slice(session_id.as_bytes());
    buf.put_u16_le(cols);
    buf.put_u16_le(rows);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Split `data` into as many Output frames as the frame budget requires.
pub fn output_frames(
    session_id: &str,
    cols: u16,
    rows: u16,
    data: &[u8],
) -> Result<Vec<Bytes>, MuxCodecError> {
    const CHUNK: usize = MAX_FRAME - (1 + SESSION_ID_LEN + 4);
    if data.is_empty() {
        return Ok(vec![output_frame(session_id, cols, rows, &[])?]);
    }
    data.chunks(CHUNK).map(|chunk| output_frame(session_id, cols, rows, chunk)).collect()
}

/// Server greeting: `[0xFF][clientId[..8]][clientId:32]`.
pub fn init_frame(client_id: &str) -> Result<Bytes, MuxCodecError> {
    if client_id.len() != CLIENT_ID_LEN || !client_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MuxCodecError::BadId);
    }
    let mut buf = BytesMut::with_capacity(INIT_CLIENT_ID_OFFSET + CLIENT_ID_LEN);
    buf.put_u8(MuxFrameType::Init as u8);
    buf.put_slice(&client_id.as_bytes()[..SESSION_ID_LEN]);
    buf.put_slice(client_id.as_bytes());
    Ok(buf.freeze())
}

/// Parse an inbound frame. Frames shorter than nine bytes or with an
/// unknown type byte are rejected.
pub fn try_parse_frame(frame: &[u8]) -> Result<MuxFrame<'_>, MuxCodecError> {
    if frame.len() > MAX_FRAME {
        return Err(MuxCodecError::Oversize(frame.len()));
    }
    if frame.len() < 1 + SESSION_ID_LEN {
        return Err(MuxCodecError::TooShort(frame.len()));
    }
    let kind = MuxFrameType::from_u8(frame[0]).ok_or(MuxCodecError::UnknownType(frame[0]))?;
    let session_id =
        std::str::from_utf8(&frame[1..=SESSION_ID_LEN]).map_err(|_| MuxCodecError::BadId)?;
    check_session_id(session_id)?;
    Ok(MuxFrame { kind, session_id, payload: &frame[1 + SESSION_ID_LEN..] })
}

/// `Resize` payload: `[cols:2 LE][rows:2 LE]`.
pub fn parse_resize_payload(payload: &[u8]) -> Result<(u16, u16), MuxCodecError> {
    if payload.len() < 4 {
        return Err(MuxCodecError::TooShort(payload.len()));
    }
    Ok((
        u16::from_le_bytes([payload[0], payload[1]]),
        u16::from_le_bytes([payload[2], payload[3]]),
    ))
}

#[cfg(test)]
#[path = "mux_codec_tests.rs"]
mod tests;
