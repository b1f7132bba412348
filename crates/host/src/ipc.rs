// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame I/O over a Unix socket.
//!
//! Both ends of the host protocol share these helpers. They use the
//! `&UnixStream` readiness API so the stream can be shared between a read
//! loop, response writers, and the heartbeat without splitting.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::net::UnixStream;

use crate::protocol::{self, DecodeError, MsgType, HEADER_LEN};

/// Socket path for a session's host endpoint.
///
/// The `mthost-` prefix doubles as the gateway's discovery glob.
pub fn endpoint_path(session_id: &str, host_pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("mthost-{session_id}-{host_pid}.sock"))
}

/// Parse a discovered endpoint filename back into `(session_id, host_pid)`.
pub fn parse_endpoint_name(file_name: &str) -> Option<(String, u32)> {
    let stem = file_name.strip_prefix("mthost-")?.strip_suffix(".sock")?;
    let (session_id, pid) = stem.rsplit_once('-')?;
    if session_id.len() != 8 || !session_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((session_id.to_owned(), pid.parse().ok()?))
}

fn decode_err(e: DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Fill `buf` completely, or fail with `UnexpectedEof` on peer close.
pub async fn read_exact(stream: &UnixStream, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        stream.readable().await?;
        match stream.try_read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read one full frame. Malformed headers surface as `InvalidData`.
pub async fn read_frame(stream: &UnixStream) -> io::Result<(MsgType, Bytes)> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(stream, &mut header).await?;
    let (msg, len) = protocol::try_read_header(&header).map_err(decode_err)?;
    let mut payload = vec![0u8; len];
    read_exact(stream, &mut payload).await?;
    Ok((msg, Bytes::from(payload)))
}

/// Write raw bytes fully.
pub async fn write_all(stream: &UnixStream, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        stream.writable().await?;
        match stream.try_write(&data[offset..]) {
            Ok(n) => offset += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Encode and write one frame.
///
/// Callers serialize frames with their per-stream write lock; this helper
/// only guarantees the bytes of a single frame go out contiguously.
pub async fn write_frame(stream: &UnixStream, msg: MsgType, payload: &[u8]) -> io::Result<()> {
    let frame = protocol::encode_frame(msg, payload);
    write_all(stream, &frame).await
}

#[cfg(test)]
#[path = "ipc_tests.rs"]
mod tests;
