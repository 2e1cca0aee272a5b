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

//! Node configuration.
//!
//! Loaded from JSON, every field is optional. Durations are milliseconds.
//!
//! ```json
//! {
//!   "keypair_path": "node.kp",
//!   "gossip": { "addr": "0.0.0.0", "port": 60000, "peers": ["10.0.0.2:60000"] },
//!   "consensus": { "cluster_size": 3 },
//!   "builder": { "poll_interval_ms": 500, "block_size_limit": 2000 },
//!   "rest": { "addr": "127.0.0.1", "port": 8000 }
//! }
//! ```

use crate::{
    blockchain::builder::{BuilderConfig, DEFAULT_BLOCK_SIZE_LIMIT, DEFAULT_POLL_INTERVAL},
    consensus::{raft::ElectionTimeout, ConsensusConfig, CONSENSUS_BROADCAST_GROUP},
    gossip::GossipConfig,
    Error, ErrorKind, Result,
};
use std::{path::Path, time::Duration};

#[cfg(feature = "rest")]
use crate::rest::RestConfig;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct GossipSection {
    pub addr: String,
    pub port: u16,
    /// Endpoints (`host:port`) to connect to at startup.
    pub peers: Vec<String>,
    pub name: String,
    pub broadcast_groups: Vec<String>,
    pub connect_retries: usize,
    pub connect_retry_interval_ms: u64,
}

impl Default for GossipSection {
    fn default() -> Self {
        GossipSection {
            addr: "127.0.0.1".to_owned(),
            port: 0,
            peers: vec![],
            name: "trinci-raft".to_owned(),
            broadcast_groups: vec![CONSENSUS_BROADCAST_GROUP.to_owned()],
            connect_retries: 10,
            connect_retry_interval_ms: 1000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ConsensusSection {
    pub cluster_size: usize,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub msg_limit: usize,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        ConsensusSection {
            cluster_size: 1,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            msg_limit: 64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BuilderSection {
    pub poll_interval_ms: u64,
    pub block_size_limit: usize,
}

impl Default for BuilderSection {
    fn default() -> Self {
        BuilderSection {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            block_size_limit: DEFAULT_BLOCK_SIZE_LIMIT,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RestSection {
    pub addr: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Ed25519 key pair file.
    pub keypair_path: Option<String>,
    /// Development only: use a random identity when no key pair file is set.
    pub random_identity: bool,
    pub gossip: GossipSection,
    pub consensus: ConsensusSection,
    pub builder: BuilderSection,
    /// HTTP front, disabled if missing.
    pub rest: Option<RestSection>,
}

impl NodeConfig {
    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// `MalformedData` if the document is not valid or inconsistent.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|err| Error::new_ext(ErrorKind::ResourceNotFound, err))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        let consensus = &self.consensus;
        if consensus.cluster_size == 0 {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "cluster size must be positive",
            ));
        }
        if consensus.election_timeout_min_ms > consensus.election_timeout_max_ms {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "election timeout min greater than max",
            ));
        }
        if self.builder.block_size_limit == 0 {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "block size limit must be positive",
            ));
        }
        if consensus.heartbeat_interval_ms >= consensus.election_timeout_min_ms {
            warn!("heartbeat interval not lower than election timeout");
        }
        Ok(())
    }

    pub fn gossip_config(&self) -> GossipConfig {
        let gossip = &self.gossip;
        GossipConfig {
            addr: gossip.addr.clone(),
            port: gossip.port,
            peers: gossip.peers.clone(),
            name: gossip.name.clone(),
            version: crate::VERSION.to_owned(),
            broadcast_groups: gossip.broadcast_groups.clone(),
            connect_retries: gossip.connect_retries,
            connect_retry_interval: Duration::from_millis(gossip.connect_retry_interval_ms),
        }
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        let consensus = &self.consensus;
        ConsensusConfig {
            cluster_size: consensus.cluster_size,
            election_timeout: ElectionTimeout {
                min: Duration::from_millis(consensus.election_timeout_min_ms),
                max: Duration::from_millis(consensus.election_timeout_max_ms),
            },
            heartbeat_interval: Duration::from_millis(consensus.heartbeat_interval_ms),
            msg_limit: consensus.msg_limit,
        }
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            poll_interval: Duration::from_millis(self.builder.poll_interval_ms),
            block_size_limit: self.builder.block_size_limit,
        }
    }

    #[cfg(feature = "rest")]
    pub fn rest_config(&self) -> Option<RestConfig> {
        self.rest.as_ref().map(|rest| RestConfig {
            addr: rest.addr.clone(),
            port: rest.port,
        })
    }
}
