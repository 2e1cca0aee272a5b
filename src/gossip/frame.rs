// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Framed Peer Channel wire codec.
//!
//! Every string field is encoded as one length byte followed by at most 255
//! UTF-8 bytes. The payload is the remainder of the frame. A frame carrying
//! only the sender field is the handshake ("hello") frame.

use crate::{Error, ErrorKind, Result};

/// Max length of a string field.
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Application message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    /// Peer address of the originator.
    pub sender: String,
    /// Peer address of the destination. Empty for broadcast.
    pub recipient: String,
    pub broadcast_group: String,
    pub object_type: String,
    /// Opaque to the transport.
    pub payload: Vec<u8>,
}

/// Decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake frame, carrying the sender address only.
    Hello(String),
    /// Application frame.
    Message(FramedMessage),
}

/// Truncates `s` to at most [MAX_FIELD_LEN] bytes without splitting a char.
fn truncated(s: &str) -> &str {
    let mut len = s.len().min(MAX_FIELD_LEN);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    &s[..len]
}

fn put_field(buf: &mut Vec<u8>, s: &str) {
    let s = truncated(s);
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
}

/// Reads a string field at `*offset`, advancing it.
fn get_field(buf: &[u8], offset: &mut usize) -> Result<String> {
    let len = *buf
        .get(*offset)
        .ok_or_else(|| Error::new_ext(ErrorKind::MalformedData, "missing field length"))?
        as usize;
    let start = *offset + 1;
    let end = start + len;
    let bytes = buf
        .get(start..end)
        .ok_or_else(|| Error::new_ext(ErrorKind::MalformedData, "truncated field"))?;
    let field = String::from_utf8(bytes.to_vec())
        .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
    *offset = end;
    Ok(field)
}

impl Frame {
    /// Encodes the frame to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Hello(sender) => {
                let mut buf = Vec::with_capacity(1 + sender.len());
                put_field(&mut buf, sender);
                buf
            }
            Frame::Message(msg) => msg.encode(),
        }
    }

    /// Decodes a wire frame.
    ///
    /// # Errors
    ///
    /// `MalformedData` if the frame is shorter than its declared fields or a
    /// field is not valid UTF-8.
    pub fn decode(buf: &[u8]) -> Result<Frame> {
        let mut offset = 0;
        let sender = get_field(buf, &mut offset)?;
        if offset == buf.len() {
            return Ok(Frame::Hello(sender));
        }
        let recipient = get_field(buf, &mut offset)?;
        let broadcast_group = get_field(buf, &mut offset)?;
        let object_type = get_field(buf, &mut offset)?;
        Ok(Frame::Message(FramedMessage {
            sender,
            recipient,
            broadcast_group,
            object_type,
            payload: buf[offset..].to_vec(),
        }))
    }
}

impl FramedMessage {
    /// Wire representation of this message.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            4 + self.sender.len()
                + self.recipient.len()
                + self.broadcast_group.len()
                + self.object_type.len()
                + self.payload.len(),
        );
        put_field(&mut buf, &self.sender);
        put_field(&mut buf, &self.recipient);
        put_field(&mut buf, &self.broadcast_group);
        put_field(&mut buf, &self.object_type);
        buf.extend_from_slice(&self.payload);
        buf
    }
}
