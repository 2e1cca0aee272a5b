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

//! Framed Peer Channel I/O.
//!
//! Frames travel over TCP prefixed by their length as a big endian `u32`.
//! Outbound frames are queued on a per-connection channel drained by a
//! dedicated writer task, so senders never wait on a slow peer.

use crate::{
    channel::{simple_channel, ChannelError, Receiver, Sender},
    Error, ErrorKind, Result,
};
use async_std::{
    io::{Read, ReadExt, Write, WriteExt},
    net::TcpStream,
};
use std::net::Shutdown;

/// Max accepted frame size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reads one length-prefixed frame.
///
/// # Errors
///
/// `BadNetwork` on stream failure or EOF, `MalformedData` if the declared
/// length exceeds [MAX_FRAME_SIZE].
pub async fn read_frame<R: Read + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|err| Error::new_ext(ErrorKind::BadNetwork, err))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::new_ext(
            ErrorKind::MalformedData,
            format!("frame too large ({} bytes)", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|err| Error::new_ext(ErrorKind::BadNetwork, err))?;
    Ok(buf)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: Write + Unpin>(writer: &mut W, buf: &[u8]) -> Result<()> {
    if buf.len() > MAX_FRAME_SIZE {
        return Err(Error::new_ext(ErrorKind::MalformedData, "frame too large"));
    }
    let len = (buf.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|err| Error::new_ext(ErrorKind::BadNetwork, err))?;
    writer
        .write_all(buf)
        .await
        .map_err(|err| Error::new_ext(ErrorKind::BadNetwork, err))?;
    writer
        .flush()
        .await
        .map_err(|err| Error::new_ext(ErrorKind::BadNetwork, err))
}

/// Sending side of an open peer channel.
#[derive(Clone)]
pub struct PeerHandle {
    /// Unique (per router) connection identifier.
    conn_id: u64,
    /// Outbound frames queue.
    tx_chan: Sender<Vec<u8>>,
}

impl PeerHandle {
    /// Creates the handle together with the receiving end of its queue.
    pub fn new(conn_id: u64) -> (Self, Receiver<Vec<u8>>) {
        let (tx_chan, rx_chan) = simple_channel();
        (PeerHandle { conn_id, tx_chan }, rx_chan)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queues a frame for the writer task.
    pub fn send(&self, buf: Vec<u8>) -> Result<()> {
        self.tx_chan.try_send(buf).map_err(|err| match err {
            ChannelError::Full => Error::new_ext(ErrorKind::BadNetwork, "peer queue full"),
            _ => Error::new_ext(ErrorKind::BadNetwork, "peer channel closed"),
        })
    }

    /// Closes the queue. The writer task shuts the stream down once drained.
    pub fn close(&self) {
        self.tx_chan.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx_chan.is_closed()
    }
}

/// Drains the outbound queue into the stream.
/// On exit the stream is shut down in both directions so the reader
/// terminates as well.
pub async fn write_loop(mut stream: TcpStream, rx_chan: Receiver<Vec<u8>>) {
    while let Ok(buf) = rx_chan.recv().await {
        if let Err(err) = write_frame(&mut stream, &buf).await {
            debug!("[gossip] write failure: {}", err.to_string_full());
            break;
        }
    }
    rx_chan.close();
    let _ = stream.shutdown(Shutdown::Both);
}
