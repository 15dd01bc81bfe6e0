// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed CBOR frame codec.
//!
//! One frame on the wire is `[4-byte big-endian length N][N bytes of CBOR]`.
//! `N == 0` and `N > MAX_FRAME` are framing errors and fatal to the session;
//! `N == MAX_FRAME` is accepted.

use crate::error::TunnelError;
use crate::message::Message;

/// Maximum CBOR payload size (16 MiB).
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Length-prefix size in bytes.
pub const HEADER_LEN: usize = 4;

/// Encode a message into a complete frame (header + CBOR payload).
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, TunnelError> {
    let mut payload = Vec::with_capacity(64);
    ciborium::into_writer(msg, &mut payload)
        .map_err(|e| TunnelError::Framing(format!("cbor encode: {e}")))?;

    if payload.len() > MAX_FRAME {
        return Err(TunnelError::Framing(format!(
            "frame payload {} exceeds max {MAX_FRAME}",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a complete frame back into a message.
///
/// The caller hands in exactly one substrate frame; a length prefix that
/// disagrees with the actual payload size is a short read or trailing
/// garbage, both framing errors.
pub fn decode_frame(frame: &[u8]) -> Result<Message, TunnelError> {
    if frame.len() < HEADER_LEN {
        return Err(TunnelError::Framing(format!("truncated header: {} bytes", frame.len())));
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&frame[..HEADER_LEN]);
    let declared = u32::from_be_bytes(header) as usize;

    if declared == 0 {
        return Err(TunnelError::Framing("zero-length frame".to_owned()));
    }
    if declared > MAX_FRAME {
        return Err(TunnelError::Framing(format!("frame length {declared} exceeds max {MAX_FRAME}")));
    }

    let payload = &frame[HEADER_LEN..];
    if payload.len() != declared {
        return Err(TunnelError::Framing(format!(
            "length prefix {declared} but payload is {} bytes",
            payload.len()
        )));
    }

    ciborium::from_reader(payload).map_err(|e| TunnelError::Decode(format!("cbor decode: {e}")))
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
