// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The controller's wire format: a `(op: u32, length: u32, payload)` frame per message, payloads
//! bincode-serialized. Both halves of the protocol use the same framing; the op code tells the
//! receiver which payload type to expect.

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const OP_REGISTER: u32 = 1;
pub const OP_REQUEST_RUN: u32 = 2;
pub const OP_KILL: u32 = 3;
pub const OP_SET_OPTION: u32 = 4;
pub const OP_STARTED: u32 = 5;
pub const OP_TERMINATED: u32 = 6;
pub const OP_SHUTDOWN: u32 = 7;
pub const OP_CLOSED: u32 = 8;

/// Frames larger than this are protocol corruption, not legitimate messages.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, op: u32, payload: &T) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(payload).map_err(|e| format!("encode op {op}: {e}"))?;
    let mut header = [0_u8; 8];
    LittleEndian::write_u32(&mut header[0..4], op);
    LittleEndian::write_u32(&mut header[4..8], bytes.len() as u32);
    writer
        .write_all(&header)
        .await
        .map_err(|e| format!("write frame header: {e}"))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| format!("write frame payload: {e}"))?;
    writer
        .flush()
        .await
        .map_err(|e| format!("flush frame: {e}"))?;
    Ok(())
}

///
/// Reads one frame. Returns None on a clean EOF at a frame boundary (the peer closed).
///
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(u32, Vec<u8>)>, String>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; 8];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(format!("read frame header: {err}")),
    }
    let op = LittleEndian::read_u32(&header[0..4]);
    let len = LittleEndian::read_u32(&header[4..8]);
    if len > MAX_FRAME_LEN {
        return Err(format!("frame of {len} bytes exceeds limit"));
    }
    let mut payload = vec![0_u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("read frame payload: {e}"))?;
    Ok(Some((op, payload)))
}

pub fn decode_payload<T: DeserializeOwned>(op: u32, payload: &[u8]) -> Result<T, String> {
    bincode::deserialize(payload).map_err(|e| format!("decode op {op}: {e}"))
}
