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

//! Consensus orchestrator worker.
//!
//! Single task owning both the replicated log engine and the block builder:
//! protocol messages, engine timers, build outcomes and engine events are
//! all handled here, one at a time.

use super::{
    message::{ConsensusRequestReceiver, ConsensusResponseSender, ConsensusStatus, Message},
    raft::{RaftEvent, RaftMessage, RaftNode},
    transport::GossipConnector,
};
use crate::{
    base::schema::{Block, ConsensusMessage},
    blockchain::{builder::BlockBuilder, pool::TransactionPool},
    channel::Receiver,
    crypto::Hashable,
    db::BlockStorage,
    wm::Vm,
    ErrorKind,
};
use async_std::task;
use futures::{future, prelude::*};
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

pub(crate) type ConsensusInbox = Receiver<(String, RaftMessage<ConsensusMessage>)>;

type Timer = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct ConsensusWorker<P: TransactionPool, V: Vm, S: BlockStorage> {
    raft: RaftNode<ConsensusMessage, GossipConnector>,
    builder: BlockBuilder<P, V, S>,
    /// Protocol messages from the transport adapter.
    inbox: ConsensusInbox,
    /// Service requests.
    rx_chan: ConsensusRequestReceiver,
    /// Log index expected by the next commit. Only used for consistency
    /// checks, the engine is authoritative.
    next_blockchain_index: u64,
    /// Highest log index appended by this node.
    last_appended: u64,
    was_leader: bool,
}

impl<P: TransactionPool, V: Vm, S: BlockStorage> ConsensusWorker<P, V, S> {
    pub fn new(
        raft: RaftNode<ConsensusMessage, GossipConnector>,
        builder: BlockBuilder<P, V, S>,
        inbox: ConsensusInbox,
        rx_chan: ConsensusRequestReceiver,
    ) -> Self {
        ConsensusWorker {
            raft,
            builder,
            inbox,
            rx_chan,
            next_blockchain_index: 1,
            last_appended: 0,
            was_leader: false,
        }
    }

    fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            raft: self.raft.status(),
            builder_state: self.builder.state(),
        }
    }

    fn handle_message(&mut self, req: Message, res_chan: ConsensusResponseSender) {
        let res = match req {
            Message::GetStatusRequest => Message::GetStatusResponse(self.status()),
            Message::GetBlocksRequest { from_height } => {
                Message::GetBlocksResponse(self.builder.get_blocks(from_height))
            }
            _ => {
                warn!("[consensus] unexpected request: {:?}", req);
                return;
            }
        };
        if res_chan.try_send(res).is_err() {
            warn!("[consensus] response send error");
        }
    }

    /// Hands a freshly built block to the replicated log.
    fn propose(&mut self, block: Block) {
        let height = block.header.height;
        let hash = block.hash();
        match self.raft.append(ConsensusMessage { block }) {
            Ok(index) => {
                debug!(
                    "[consensus] block {} ({}) appended at index {}",
                    height, hash, index
                );
                self.last_appended = index;
            }
            Err(err) => {
                warn!(
                    "[consensus] block {} not appended: {}",
                    height,
                    err.to_string_full()
                );
                self.builder.discard_candidate();
            }
        }
    }

    fn handle_events(&mut self) {
        for event in self.raft.take_events() {
            match event {
                RaftEvent::Committed { index, data } => self.on_committed(index, data.block),
                RaftEvent::LeaderElected { term } => self.on_leader_elected(term),
            }
        }
    }

    fn on_committed(&mut self, index: u64, block: Block) {
        if index != self.next_blockchain_index {
            warn!(
                "[consensus] committed index {} while expecting {}",
                index, self.next_blockchain_index
            );
        }
        self.next_blockchain_index = index + 1;

        let height = block.header.height;
        let hash = block.hash();
        debug!(
            "[consensus] {}: block {} ({}) committed at index {}",
            self.raft.id(),
            height,
            hash,
            index
        );
        match self.builder.commit_block(block) {
            Ok(()) => (),
            Err(err) if err.kind == ErrorKind::BrokenIntegrity => {
                warn!(
                    "[consensus] block {} ({}) skipped: {}",
                    height,
                    hash,
                    err.to_string_full()
                );
            }
            Err(err) => {
                // No reconciliation against the log: production stalls until
                // the next commit or election.
                error!(
                    "[consensus] failed to commit block {} ({}): {}",
                    height,
                    hash,
                    err.to_string_full()
                );
                return;
            }
        }
        if self.raft.is_leader() && index == self.last_appended {
            self.builder.append_next_block();
        }
    }

    fn on_leader_elected(&mut self, term: u64) {
        info!(
            "[consensus] {} elected as leader for term {}",
            self.raft.id(),
            term
        );
        self.last_appended = self.raft.last_index();
        self.builder.append_next_block();
    }

    fn check_leadership(&mut self) {
        let is_leader = self.raft.is_leader();
        if self.was_leader && !is_leader {
            info!("[consensus] {} is no longer leader", self.raft.id());
            self.builder.discard_candidate();
        }
        self.was_leader = is_leader;
    }

    fn raft_timer(&self) -> (Instant, Timer) {
        let deadline = self.raft.next_deadline();
        let delay = deadline.saturating_duration_since(Instant::now());
        (deadline, Box::pin(task::sleep(delay)))
    }

    /// Worker asynchronous task.
    /// This can be stopped by submitting a `Stop` message to its input channel.
    pub async fn run(&mut self) {
        info!("[consensus] {} running", self.raft.id());
        self.builder.start();
        let (mut deadline, mut timer) = self.raft_timer();

        let future = future::poll_fn(|cx: &mut Context<'_>| -> Poll<()> {
            loop {
                match self.rx_chan.poll_next_unpin(cx) {
                    Poll::Ready(Some((Message::Stop, _))) => return Poll::Ready(()),
                    Poll::Ready(Some((req, res_chan))) => self.handle_message(req, res_chan),
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Pending => break,
                }
            }

            while let Poll::Ready(Some((from, msg))) = self.inbox.poll_next_unpin(cx) {
                self.raft.step(Instant::now(), &from, msg);
            }

            while let Poll::Ready(block) = self.builder.poll_ready_block(cx) {
                self.propose(block);
            }

            self.handle_events();
            self.check_leadership();

            if deadline != self.raft.next_deadline() {
                (deadline, timer) = self.raft_timer();
            }
            if timer.poll_unpin(cx).is_ready() {
                self.raft.tick(Instant::now());
                (deadline, timer) = self.raft_timer();
                // Handle the tick outcome and poll the new timer.
                cx.waker().wake_by_ref();
            }
            Poll::Pending
        });
        future.await;

        self.builder.stop();
        self.raft.close();
        info!("[consensus] {} stopped", self.raft.id());
    }

    /// Worker synchronous task.
    pub fn run_sync(&mut self) {
        task::block_on(self.run());
    }
}
