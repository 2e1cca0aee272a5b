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

//! Consensus orchestrator service.
//!
//! Wires the replicated log engine, the consensus transport adapter and the
//! block production pipeline together, and runs them on a dedicated thread.

use super::{
    message::{ConsensusRequestSender, ConsensusStatus, Message},
    raft::{ElectionTimeout, RaftConfig, RaftMessage, RaftNode, RaftState},
    transport::{ConnectorListener, GossipConnector, CONSENSUS_BROADCAST_GROUP},
    worker::{ConsensusInbox, ConsensusWorker},
};
use crate::{
    base::{
        schema::{Block, ConsensusMessage},
        Mutex, RwLock,
    },
    blockchain::{
        builder::{BlockBuilder, BuilderConfig},
        pool::TransactionPool,
    },
    channel::{confirmed_channel, simple_channel, Sender},
    db::BlockStorage,
    gossip::{GossipListener, GossipSender},
    wm::Vm,
    Error, ErrorKind, Result,
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Max time to wait for a worker answer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Consensus service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusConfig {
    /// Number of voting nodes.
    pub cluster_size: usize,
    pub election_timeout: ElectionTimeout,
    pub heartbeat_interval: Duration,
    /// Max number of log entries per replication message.
    pub msg_limit: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            cluster_size: 1,
            election_timeout: ElectionTimeout {
                min: Duration::from_millis(150),
                max: Duration::from_millis(300),
            },
            heartbeat_interval: Duration::from_millis(50),
            msg_limit: 64,
        }
    }
}

/// Consensus service data.
pub struct ConsensusService<P: TransactionPool, V: Vm, S: BlockStorage> {
    /// Local node identifier.
    id: String,
    /// Worker object, until started.
    worker: Option<ConsensusWorker<P, V, S>>,
    /// Worker thread handler.
    handler: Option<JoinHandle<()>>,
    /// To send requests to the worker.
    tx_chan: ConsensusRequestSender,
    /// Transport adapter inbound half.
    listener: Arc<ConnectorListener<RaftMessage<ConsensusMessage>>>,
    /// Transaction pool shared reference.
    pool: Arc<RwLock<P>>,
    /// Block storage shared reference.
    storage: Arc<RwLock<S>>,
    /// To check if the worker thread is still alive.
    canary: Arc<()>,
}

impl<P: TransactionPool, V: Vm, S: BlockStorage> ConsensusService<P, V, S> {
    /// Create a new consensus service instance.
    ///
    /// `id` is the local peer address, the same used by the gossip router.
    pub fn new(
        id: String,
        config: ConsensusConfig,
        builder_config: BuilderConfig,
        gossip: Arc<dyn GossipSender>,
        pool: P,
        vm: V,
        storage: S,
    ) -> Self {
        info!(
            "[consensus] {}: cluster size {}, election timeout {}-{} ms",
            id,
            config.cluster_size,
            config.election_timeout.min.as_millis(),
            config.election_timeout.max.as_millis()
        );
        let pool = Arc::new(RwLock::new(pool));
        let storage = Arc::new(RwLock::new(storage));
        let builder = BlockBuilder::new(
            builder_config,
            pool.clone(),
            Arc::new(Mutex::new(vm)),
            storage.clone(),
        );

        let raft_config = RaftConfig {
            id: id.clone(),
            cluster_size: config.cluster_size,
            election_timeout: config.election_timeout,
            heartbeat_interval: config.heartbeat_interval,
            msg_limit: config.msg_limit,
        };
        let connector = GossipConnector::new(id.clone(), gossip);
        let raft = RaftNode::new(raft_config, connector, Instant::now());

        let (inbox_tx, inbox_rx): (Sender<_>, ConsensusInbox) = simple_channel();
        let listener = Arc::new(ConnectorListener::new(id.clone(), inbox_tx));
        let (tx_chan, rx_chan) = confirmed_channel::<Message, Message>();
        let worker = ConsensusWorker::new(raft, builder, inbox_rx, rx_chan);

        ConsensusService {
            id,
            worker: Some(worker),
            handler: None,
            tx_chan,
            listener,
            pool,
            storage,
            canary: Arc::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Listener to register under the consensus broadcast group.
    pub fn listener(&self) -> Arc<dyn GossipListener> {
        self.listener.clone()
    }

    /// Feeds a consensus group message received from `from`.
    pub fn on_message_received(&self, from: &str, object_type: &str, payload: &[u8]) -> Result<()> {
        self.listener
            .gossip_message_received(from, CONSENSUS_BROADCAST_GROUP, object_type, payload)
    }

    /// Start consensus service.
    /// A stopped service cannot be started again.
    pub fn start(&mut self) {
        debug!("[consensus] starting service");
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                warn!("[consensus] service was already started");
                return;
            }
        };

        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            worker.run_sync();
        });
        self.handler = Some(handle);
    }

    /// Stop consensus service.
    /// Closes the replicated log engine and stops the block builder.
    pub fn stop(&mut self) {
        debug!("[consensus] stopping service");
        match self.handler.take() {
            Some(handle) => {
                if let Err(err) = self.tx_chan.send_sync(Message::Stop) {
                    error!("[consensus] error stopping service thread: {}", err);
                }
                if handle.join().is_err() {
                    error!("[consensus] service thread panicked");
                }
            }
            None => debug!("[consensus] service was not running"),
        }
    }

    /// Check if service is running.
    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2 && self.worker.is_none()
    }

    fn request(&self, req: Message) -> Result<Message> {
        let res_chan = self.tx_chan.send_sync(req)?;
        Ok(res_chan.recv_timeout_sync(REQUEST_TIMEOUT)?)
    }

    /// Replicated log and pipeline status.
    ///
    /// # Errors
    ///
    /// `Timeout` if the worker does not answer, `Other` if it is not running.
    pub fn get_status(&self) -> Result<ConsensusStatus> {
        match self.request(Message::GetStatusRequest)? {
            Message::GetStatusResponse(status) => Ok(status),
            res => Err(Error::new_ext(
                ErrorKind::Other,
                format!("unexpected response: {:?}", res),
            )),
        }
    }

    pub fn get_state(&self) -> Option<RaftState> {
        self.get_status().ok().map(|status| status.raft.state)
    }

    pub fn is_leader(&self) -> bool {
        self.get_state() == Some(RaftState::Leader)
    }

    /// Committed blocks from `from_height`, `None` on failure.
    pub fn get_blocks(&self, from_height: u64) -> Option<Vec<Block>> {
        match self.request(Message::GetBlocksRequest { from_height }) {
            Ok(Message::GetBlocksResponse(blocks)) => blocks,
            Ok(res) => {
                warn!("[consensus] unexpected response: {:?}", res);
                None
            }
            Err(err) => {
                warn!("[consensus] get blocks failure: {}", err.to_string_full());
                None
            }
        }
    }

    /// Get a shared reference to the transaction pool.
    pub fn pool_arc(&self) -> Arc<RwLock<P>> {
        self.pool.clone()
    }

    /// Get a shared reference to the block storage.
    pub fn storage_arc(&self) -> Arc<RwLock<S>> {
        self.storage.clone()
    }
}

impl<P: TransactionPool, V: Vm, S: BlockStorage> Drop for ConsensusService<P, V, S> {
    fn drop(&mut self) {
        self.stop();
    }
}
