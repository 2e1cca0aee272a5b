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

//! Consensus Transport Adapter.
//!
//! Carries opaque replicated-log protocol messages over the gossip router,
//! under a fixed broadcast group and message type. Inbound messages
//! addressed to another node are dropped before reaching the engine.

use crate::{
    base::serialize::{rmp_deserialize, rmp_serialize},
    channel::{ChannelError, Sender},
    gossip::{GossipListener, GossipSender},
    Error, ErrorKind, Result,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Broadcast group of the consensus traffic.
pub const CONSENSUS_BROADCAST_GROUP: &str = "consensus";

/// Message type of the replicated-log protocol messages.
pub const RAFT_MESSAGE_TYPE: &str = "RaftMessage";

/// Messages that may name their recipient.
pub trait Addressed {
    /// `None` means every node.
    fn recipient(&self) -> Option<&str>;
}

/// Transport capability required by the replicated-log engine.
pub trait Transport<M>: Send + 'static {
    fn connect(&mut self) {}

    fn disconnect(&mut self) {}

    fn broadcast(&self, msg: &M) -> Result<()>;

    fn send(&self, node_id: &str, msg: &M) -> Result<()>;
}

/// Wire envelope: protocol message plus originating node id.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Envelope<M> {
    pub from: String,
    pub data: M,
}

/// Borrowing twin of [Envelope], same wire format.
#[derive(Serialize)]
struct EnvelopeRef<'a, M> {
    from: &'a str,
    data: &'a M,
}

/// Outbound half of the adapter.
pub struct GossipConnector {
    id: String,
    gossip: Arc<dyn GossipSender>,
    connected: bool,
}

impl GossipConnector {
    pub fn new(id: String, gossip: Arc<dyn GossipSender>) -> Self {
        GossipConnector {
            id,
            gossip,
            connected: false,
        }
    }

    fn pack<M: Serialize>(&self, msg: &M) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(Error::new_ext(
                ErrorKind::BadNetwork,
                "consensus transport disconnected",
            ));
        }
        rmp_serialize(&EnvelopeRef {
            from: self.id.as_str(),
            data: msg,
        })
    }
}

impl<M: Serialize> Transport<M> for GossipConnector {
    fn connect(&mut self) {
        self.connected = true;
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn broadcast(&self, msg: &M) -> Result<()> {
        let buf = self.pack(msg)?;
        trace!("[consensus] broadcast packet size: {}", buf.len());
        self.gossip
            .broadcast_message(CONSENSUS_BROADCAST_GROUP, RAFT_MESSAGE_TYPE, buf, true)
    }

    fn send(&self, node_id: &str, msg: &M) -> Result<()> {
        let buf = self.pack(msg)?;
        trace!(
            "[consensus] unicast packet size: {} (to {})",
            buf.len(),
            node_id
        );
        self.gossip.unicast_message(
            node_id,
            CONSENSUS_BROADCAST_GROUP,
            RAFT_MESSAGE_TYPE,
            buf,
            true,
        )
    }
}

/// Inbound half of the adapter, registered as the consensus group listener.
pub struct ConnectorListener<M> {
    id: String,
    inbox: Sender<(String, M)>,
}

impl<M> ConnectorListener<M>
where
    M: Addressed,
{
    pub fn new(id: String, inbox: Sender<(String, M)>) -> Self {
        ConnectorListener { id, inbox }
    }

    /// Forwards `msg` to the engine inbox unless addressed to another node.
    pub fn received(&self, origin: &str, msg: M) -> Result<()> {
        if let Some(to) = msg.recipient() {
            if to != self.id {
                trace!("[consensus] message for {} dropped", to);
                return Ok(());
            }
        }
        self.inbox
            .try_send((origin.to_owned(), msg))
            .map_err(|err| match err {
                ChannelError::Full => Error::new_ext(ErrorKind::Other, "consensus inbox full"),
                err => Error::new_ext(ErrorKind::Other, err),
            })
    }
}

impl<M> GossipListener for ConnectorListener<M>
where
    M: Addressed + DeserializeOwned + Send + 'static,
{
    fn gossip_message_received(
        &self,
        _from: &str,
        _broadcast_group: &str,
        object_type: &str,
        payload: &[u8],
    ) -> Result<()> {
        match object_type {
            RAFT_MESSAGE_TYPE => {
                let envelope: Envelope<M> = rmp_deserialize(payload)?;
                self.received(&envelope.from, envelope.data)
            }
            _ => {
                debug!("[consensus] unexpected message type: {}", object_type);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::simple_channel,
        consensus::raft::RaftMessage,
        gossip::MockGossipSender,
    };
    use std::time::Duration;

    type Msg = RaftMessage<u32>;

    fn vote_reply(to: &str) -> Msg {
        RaftMessage::RequestVoteReply {
            to: to.to_owned(),
            term: 3,
            granted: true,
        }
    }

    fn pack(from: &str, msg: &Msg) -> Vec<u8> {
        rmp_serialize(&EnvelopeRef { from, data: msg }).unwrap()
    }

    #[test]
    fn broadcast_goes_to_consensus_group() {
        let msg: Msg = RaftMessage::RequestVote {
            term: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let expected = pack("node1", &msg);
        let mut gossip = MockGossipSender::new();
        gossip
            .expect_broadcast_message()
            .withf(move |group, object_type, payload, immediate| {
                group == CONSENSUS_BROADCAST_GROUP
                    && object_type == RAFT_MESSAGE_TYPE
                    && *payload == expected
                    && *immediate
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut connector = GossipConnector::new("node1".to_owned(), Arc::new(gossip));
        Transport::<Msg>::connect(&mut connector);

        connector.broadcast(&msg).unwrap();
    }

    #[test]
    fn send_is_unicast() {
        let mut gossip = MockGossipSender::new();
        gossip
            .expect_unicast_message()
            .withf(|recipient, group, object_type, _, _| {
                recipient == "node2"
                    && group == CONSENSUS_BROADCAST_GROUP
                    && object_type == RAFT_MESSAGE_TYPE
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let mut connector = GossipConnector::new("node1".to_owned(), Arc::new(gossip));
        Transport::<Msg>::connect(&mut connector);

        connector.send("node2", &vote_reply("node2")).unwrap();
    }

    #[test]
    fn disconnected_connector_does_not_send() {
        let connector = GossipConnector::new("node1".to_owned(), Arc::new(MockGossipSender::new()));

        let err = connector.send("node2", &vote_reply("node2")).unwrap_err();

        assert_eq!(err.kind, ErrorKind::BadNetwork);
    }

    #[test]
    fn inbound_for_this_node_is_forwarded() {
        let (tx_chan, rx_chan) = simple_channel();
        let listener = ConnectorListener::<Msg>::new("node1".to_owned(), tx_chan);

        listener
            .gossip_message_received(
                "node2",
                CONSENSUS_BROADCAST_GROUP,
                RAFT_MESSAGE_TYPE,
                &pack("node2", &vote_reply("node1")),
            )
            .unwrap();

        let (from, msg) = rx_chan.recv_timeout_sync(Duration::from_millis(100)).unwrap();
        assert_eq!(from, "node2");
        assert_eq!(msg, vote_reply("node1"));
    }

    #[test]
    fn inbound_for_other_node_is_dropped() {
        let (tx_chan, rx_chan) = simple_channel();
        let listener = ConnectorListener::<Msg>::new("node1".to_owned(), tx_chan);

        listener
            .gossip_message_received(
                "node2",
                CONSENSUS_BROADCAST_GROUP,
                RAFT_MESSAGE_TYPE,
                &pack("node2", &vote_reply("node3")),
            )
            .unwrap();

        assert!(rx_chan
            .recv_timeout_sync(Duration::from_millis(100))
            .is_err());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let (tx_chan, _rx_chan) = simple_channel();
        let listener = ConnectorListener::<Msg>::new("node1".to_owned(), tx_chan);

        let err = listener
            .gossip_message_received("node2", CONSENSUS_BROADCAST_GROUP, RAFT_MESSAGE_TYPE, &[0xc1])
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let (tx_chan, rx_chan) = simple_channel::<(String, Msg)>();
        let listener = ConnectorListener::<Msg>::new("node1".to_owned(), tx_chan);

        listener
            .gossip_message_received("node2", CONSENSUS_BROADCAST_GROUP, "Block", &[1, 2])
            .unwrap();

        assert!(rx_chan
            .recv_timeout_sync(Duration::from_millis(100))
            .is_err());
    }
}
