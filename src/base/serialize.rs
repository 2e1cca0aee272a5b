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

//! MessagePack helpers used for consensus payloads and block hashing.

use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Serialize using MessagePack format (without field names).
///
/// # Error
///
/// If the data cannot be serialized a `MalformedData` error kind is returned.
pub fn rmp_serialize<T>(val: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(val).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Deserialize using MessagePack format.
///
/// # Error
///
/// If the data cannot be deserialized a `MalformedData` error kind is returned.
pub fn rmp_deserialize<'a, T>(buf: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    rmp_serde::from_slice(buf).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::{Block, ConsensusMessage, StateDiffEntry};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Envelope {
        from: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    }

    const ENVELOPE_HEX: &str = "92a46e6f6465c403010203";

    #[test]
    fn envelope_serialize() {
        let envelope = Envelope {
            from: "node".to_string(),
            data: vec![1, 2, 3],
        };

        let buf = rmp_serialize(&envelope).unwrap();

        assert_eq!(hex::encode(&buf), ENVELOPE_HEX);
    }

    #[test]
    fn envelope_deserialize() {
        let buf = hex::decode(ENVELOPE_HEX).unwrap();

        let envelope: Envelope = rmp_deserialize(&buf).unwrap();

        assert_eq!(envelope.from, "node");
        assert_eq!(envelope.data, vec![1, 2, 3]);
    }

    #[test]
    fn consensus_message_keeps_block() {
        let mut block = Block::genesis();
        block.body.state_diff.push(StateDiffEntry {
            contract: "asset".to_string(),
            key: "alice".to_string(),
            value: vec![0x2a],
        });
        let msg = ConsensusMessage { block };

        let buf = rmp_serialize(&msg).unwrap();
        let decoded: ConsensusMessage = rmp_deserialize(&buf).unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_buffer_is_malformed() {
        let buf = hex::decode(ENVELOPE_HEX).unwrap();

        let err = rmp_deserialize::<Envelope>(&buf[..4]).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }
}
