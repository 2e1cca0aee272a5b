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

//! Requests to the consensus worker.

use super::raft::RaftStatus;
use crate::{base::schema::Block, blockchain::builder::BuilderState, channel};

/// Orchestrator state snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsensusStatus {
    #[serde(flatten)]
    pub raft: RaftStatus,
    pub builder_state: BuilderState,
}

/// Message types enumeration.
#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// Replicated log and pipeline status request.
    GetStatusRequest,
    GetStatusResponse(ConsensusStatus),
    /// Committed blocks starting from the given height.
    GetBlocksRequest { from_height: u64 },
    /// `None` on storage failure.
    GetBlocksResponse(Option<Vec<Block>>),
    /// Stop the consensus worker.
    Stop,
}

/// Sender half of the consensus worker request channel.
pub type ConsensusRequestSender = channel::RequestSender<Message, Message>;

/// Receiver half of the consensus worker request channel.
pub type ConsensusRequestReceiver = channel::RequestReceiver<Message, Message>;

/// Sender used by the worker to answer a request.
pub type ConsensusResponseSender = channel::Sender<Message>;

/// Receiver returned to the requester.
pub type ConsensusResponseReceiver = channel::Receiver<Message>;
