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

//! TRINCI Raft node core.
//!
//! Peer-to-peer gossip transport, embedded Raft replicated log and the block
//! production pipeline driven by it.

// External crates macros.
#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// Public modules.
pub mod base;
pub mod blockchain;
pub mod channel;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod db;
pub mod error;
pub mod gossip;
pub mod node;
pub mod wm;

// Optional public modules.
#[cfg(feature = "rest")]
pub mod rest;

pub use base::{Block, ConsensusMessage, Transaction, TransactionEntry};
pub use blockchain::{BlockBuilder, BuilderConfig, MemoryPool, TransactionPool};
pub use config::NodeConfig;
pub use consensus::{ConsensusConfig, ConsensusService};
pub use crypto::{Hash, KeyPair, PublicKey};
pub use db::{BlockStorage, MemoryDb};
pub use error::{Error, ErrorKind, Result};
pub use gossip::{GossipConfig, GossipService};
pub use node::Node;
pub use wm::Vm;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
