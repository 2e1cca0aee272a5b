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

//! Node wiring: gossip transport, consensus orchestrator and, optionally,
//! the HTTP front, started and stopped together.

use crate::{
    blockchain::pool::TransactionPool,
    config::NodeConfig,
    consensus::{ConsensusService, CONSENSUS_BROADCAST_GROUP},
    crypto::{Identity, KeyPair},
    db::BlockStorage,
    gossip::{GossipService, Router},
    wm::Vm,
    Error, ErrorKind, Result,
};
use std::{net::SocketAddr, sync::Arc};

#[cfg(feature = "rest")]
use crate::rest::RestService;

pub struct Node<P: TransactionPool, V: Vm, S: BlockStorage> {
    /// Local peer address.
    address: String,
    gossip: GossipService,
    consensus: ConsensusService<P, V, S>,
    #[cfg(feature = "rest")]
    rest: Option<RestService>,
}

impl<P: TransactionPool, V: Vm, S: BlockStorage> Node<P, V, S> {
    /// Loads the node key pair.
    ///
    /// A random identity is generated only if no file is named and
    /// `random_identity` is set.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if no key pair is configured or the named file
    /// cannot be read, `MalformedData` if its content is not a key pair.
    pub fn load_keypair(config: &NodeConfig) -> Result<KeyPair> {
        match &config.keypair_path {
            Some(path) => KeyPair::from_file(path),
            None if config.random_identity => {
                warn!("no key pair configured, using a random identity");
                Ok(KeyPair::from_random())
            }
            None => Err(Error::new_ext(
                ErrorKind::ResourceNotFound,
                "no key pair configured",
            )),
        }
    }

    /// Builds the node services. The consensus listener is registered under
    /// the consensus broadcast group and the topology is checked against the
    /// configured groups.
    pub fn new(
        config: &NodeConfig,
        identity: &dyn Identity,
        pool: P,
        vm: V,
        storage: S,
    ) -> Result<Self> {
        let address = identity.who_am_i();
        info!("node address: {}", address);

        let gossip_config = config.gossip_config();
        let broadcast_groups = gossip_config.broadcast_groups.clone();
        let gossip = GossipService::new(gossip_config, address.clone());
        let router = gossip.router();

        let consensus = ConsensusService::new(
            address.clone(),
            config.consensus_config(),
            config.builder_config(),
            Arc::new(router.clone()),
            pool,
            vm,
            storage,
        );
        router.register_listener(CONSENSUS_BROADCAST_GROUP, consensus.listener());
        router.validate_topology(&broadcast_groups)?;

        #[cfg(feature = "rest")]
        let rest = config
            .rest_config()
            .map(|rest_config| RestService::new(rest_config, gossip.rpc()));

        Ok(Node {
            address,
            gossip,
            consensus,
            #[cfg(feature = "rest")]
            rest,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Gossip listening endpoint, once started.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.gossip.local_endpoint()
    }

    pub fn router(&self) -> Router {
        self.gossip.router()
    }

    pub fn consensus(&self) -> &ConsensusService<P, V, S> {
        &self.consensus
    }

    /// Starts the services.
    ///
    /// # Errors
    ///
    /// `BadNetwork` if the gossip endpoint cannot be bound.
    pub fn start(&mut self) -> Result<()> {
        self.gossip.start()?;
        self.consensus.start();
        #[cfg(feature = "rest")]
        {
            if let Some(rest) = self.rest.as_mut() {
                rest.start();
            }
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        #[cfg(feature = "rest")]
        {
            if let Some(rest) = self.rest.as_mut() {
                rest.stop();
            }
        }
        self.consensus.stop();
        self.gossip.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::schema::tests::{create_test_execution, create_test_transaction},
        blockchain::pool::MemoryPool,
        config::{ConsensusSection, GossipSection},
        crypto::Hashable,
        db::MemoryDb,
        gossip::router::tests::wait_until,
        wm::MockVm,
    };

    type TestNode = Node<MemoryPool, MockVm, MemoryDb>;

    fn create_vm() -> MockVm {
        let mut vm = MockVm::new();
        vm.expect_process_transaction_set()
            .returning(|entries| Ok(create_test_execution(entries)));
        vm
    }

    fn create_config(cluster_size: usize, peers: Vec<String>) -> NodeConfig {
        NodeConfig {
            gossip: GossipSection {
                peers,
                connect_retry_interval_ms: 100,
                ..Default::default()
            },
            consensus: ConsensusSection {
                cluster_size,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn create_node(config: &NodeConfig) -> TestNode {
        let keypair = KeyPair::from_random();
        let mut pool = MemoryPool::new();
        for i in 0..2 {
            pool.put_transaction(create_test_transaction("alice", i).transaction);
        }
        Node::new(config, &keypair, pool, create_vm(), MemoryDb::new()).unwrap()
    }

    fn last_height(node: &TestNode) -> u64 {
        node.consensus()
            .storage_arc()
            .read()
            .get_last_block()
            .map(|block| block.header.height)
            .unwrap_or_default()
    }

    #[test]
    fn missing_keypair_file() {
        let config = NodeConfig {
            keypair_path: Some("/this/key/does/not/exist".to_owned()),
            ..Default::default()
        };

        let err = TestNode::load_keypair(&config).err().unwrap();

        assert_eq!(err.kind, ErrorKind::ResourceNotFound);
    }

    #[test]
    fn missing_keypair_is_fatal() {
        let config = NodeConfig::default();

        let err = TestNode::load_keypair(&config).err().unwrap();

        assert_eq!(err.kind, ErrorKind::ResourceNotFound);
    }

    #[test]
    fn random_identity_when_allowed() {
        let config = NodeConfig {
            random_identity: true,
            ..Default::default()
        };

        let first = TestNode::load_keypair(&config).unwrap();
        let second = TestNode::load_keypair(&config).unwrap();

        assert_ne!(first.who_am_i(), second.who_am_i());
    }

    #[test]
    fn unknown_broadcast_group() {
        let mut config = create_config(1, vec![]);
        config.gossip.broadcast_groups.push("transactions".to_owned());
        let keypair = KeyPair::from_random();

        let err = TestNode::new(
            &config,
            &keypair,
            MemoryPool::new(),
            create_vm(),
            MemoryDb::new(),
        )
        .err()
        .unwrap();

        assert_eq!(err.kind, ErrorKind::UnknownBroadcastGroup);
    }

    #[test]
    fn unbindable_endpoint() {
        let mut first = create_node(&create_config(1, vec![]));
        first.start().unwrap();
        let mut config = create_config(1, vec![]);
        config.gossip.port = first.local_endpoint().unwrap().port();
        let mut second = create_node(&config);

        let err = second.start().unwrap_err();

        assert_eq!(err.kind, ErrorKind::BadNetwork);
        first.stop();
    }

    #[test]
    fn three_nodes_over_tcp() {
        let mut nodes: Vec<TestNode> = vec![];
        for _ in 0..3 {
            let peers = nodes
                .iter()
                .filter_map(|node| node.local_endpoint())
                .map(|endpoint| endpoint.to_string())
                .collect();
            let mut node = create_node(&create_config(3, peers));
            node.start().unwrap();
            nodes.push(node);
        }
        let addresses: Vec<String> = nodes.iter().map(|n| n.address().to_owned()).collect();
        assert!(wait_until(|| nodes.iter().all(|node| {
            addresses
                .iter()
                .filter(|addr| *addr != node.address())
                .all(|addr| node.router().is_connected(addr))
        })));

        assert!(wait_until(|| nodes.iter().all(|node| last_height(node) >= 1)));

        let hashes: Vec<_> = nodes
            .iter()
            .map(|node| node.consensus().get_blocks(1).unwrap()[0].hash())
            .collect();
        assert!(hashes.iter().all(|hash| *hash == hashes[0]));
        assert_eq!(
            nodes.iter().filter(|node| node.consensus().is_leader()).count(),
            1
        );

        nodes.iter_mut().for_each(|node| node.stop());
    }
}
