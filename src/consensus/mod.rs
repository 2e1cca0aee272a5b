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

//! Consensus orchestrator.
//!
//! Blocks produced by the builder travel through the replicated log and are
//! persisted on every node once committed. The log engine reaches the other
//! nodes through the gossip router, under the `consensus` broadcast group.

pub mod message;
pub mod raft;
pub mod service;
pub mod transport;

pub(crate) mod worker;

pub use message::{ConsensusStatus, Message};
pub use raft::{ElectionTimeout, RaftState, RaftStatus};
pub use service::{ConsensusConfig, ConsensusService};
pub use transport::{CONSENSUS_BROADCAST_GROUP, RAFT_MESSAGE_TYPE};
