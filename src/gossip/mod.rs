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

//! Gossip transport: framed peer channels, broadcast group routing and the
//! exposed message submission surface.

pub mod frame;
pub mod peer;
pub mod router;
pub mod service;
pub mod topology;
pub mod worker;

use crate::Result;

#[cfg(test)]
use mockall::automock;

pub use frame::{Frame, FramedMessage};
pub use router::Router;
pub use service::{
    BroadcastMessageRequest, GossipConfig, GossipRpc, GossipService, HeartbeatRequest,
    HeartbeatResponse, UnicastMessageRequest,
};
pub use topology::{GossipListener, Topology};

/// Outbound side of the gossip transport.
///
/// `immediate` is accepted for interface compatibility only, every send is
/// queued right away.
#[cfg_attr(test, automock)]
pub trait GossipSender: Send + Sync + 'static {
    /// Sends to every connected peer with an empty recipient.
    fn broadcast_message(
        &self,
        broadcast_group: &str,
        object_type: &str,
        payload: Vec<u8>,
        immediate: bool,
    ) -> Result<()>;

    /// Sends to `recipient`, or to every connected peer if it is not connected.
    fn unicast_message(
        &self,
        recipient: &str,
        broadcast_group: &str,
        object_type: &str,
        payload: Vec<u8>,
        immediate: bool,
    ) -> Result<()>;
}
