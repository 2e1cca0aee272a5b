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

//! Block production pipeline.
//!
//! The builder runs on the leader node. It picks up to `block_size_limit`
//! pending transactions, executes them and assembles the block following the
//! last committed one. The block is then handed to the consensus layer and
//! persisted by [BlockBuilder::commit_block] only once the replicated log
//! reports it as committed.
//!
//! The builder is a state machine driven by the consensus worker:
//!
//! ```text
//!   Idle --append--> Building --block--> WaitingForCommit --commit--> Idle
//!                       |  ^
//!               no txs  v  | poll interval
//!                  RetryScheduled
//! ```
//!
//! At most one build is in flight at any time. Builds run on a separate task
//! and their outcome is collected through [BlockBuilder::poll_ready_block];
//! outcomes produced by a superseded build (stop or leadership loss in the
//! meantime) are discarded.

use crate::{
    base::{
        schema::{Block, TransactionEntry},
        Mutex, RwLock,
    },
    blockchain::pool::TransactionPool,
    channel::{simple_channel, Receiver, Sender},
    crypto::Hash,
    db::BlockStorage,
    wm::Vm,
    Error, ErrorKind, Result,
};
use async_std::task;
use futures::{future::FutureExt, stream::StreamExt, Future};
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Default pending pool polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default maximum number of transactions per block.
pub const DEFAULT_BLOCK_SIZE_LIMIT: usize = 2000;

/// Block builder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Retry interval when the pending pool is empty.
    pub poll_interval: Duration,
    /// Maximum number of transactions per block.
    pub block_size_limit: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            block_size_limit: DEFAULT_BLOCK_SIZE_LIMIT,
        }
    }
}

/// Pipeline state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Idle,
    Building,
    WaitingForCommit,
    RetryScheduled,
}

/// Result of a build task, tagged with the generation that spawned it.
struct BuildOutcome {
    generation: u64,
    result: Result<Option<Block>>,
}

type RetryTimer = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct BlockBuilder<P: TransactionPool, V: Vm, S: BlockStorage> {
    config: BuilderConfig,
    pool: Arc<RwLock<P>>,
    vm: Arc<Mutex<V>>,
    storage: Arc<RwLock<S>>,
    /// Last committed block, fetched from storage at most once.
    last_block: Option<Block>,
    state: BuilderState,
    retry: Option<RetryTimer>,
    /// Incremented every time the retry timer is armed.
    retry_seq: u64,
    /// Block handed to consensus and not yet committed.
    candidate: Option<Block>,
    running: bool,
    /// Bumped every time in-flight build results become irrelevant.
    generation: u64,
    outcome_tx: Sender<BuildOutcome>,
    outcome_rx: Receiver<BuildOutcome>,
}

impl<P: TransactionPool, V: Vm, S: BlockStorage> BlockBuilder<P, V, S> {
    pub fn new(
        config: BuilderConfig,
        pool: Arc<RwLock<P>>,
        vm: Arc<Mutex<V>>,
        storage: Arc<RwLock<S>>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = simple_channel();
        BlockBuilder {
            config,
            pool,
            vm,
            storage,
            last_block: None,
            state: BuilderState::Idle,
            retry: None,
            retry_seq: 0,
            candidate: None,
            running: false,
            generation: 0,
            outcome_tx,
            outcome_rx,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns true if an empty pool retry is armed.
    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    pub fn candidate(&self) -> Option<&Block> {
        self.candidate.as_ref()
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stops the pipeline.
    /// The retry timer is cancelled; an in-flight build keeps running but its
    /// result will be discarded.
    pub fn stop(&mut self) {
        self.running = false;
        self.retry = None;
        self.candidate = None;
        self.generation += 1;
        self.state = BuilderState::Idle;
    }

    /// Starts building the block following the last committed one.
    ///
    /// Does nothing if a build is already in flight or a candidate is waiting
    /// for commit.
    pub fn append_next_block(&mut self) {
        if !self.running {
            debug!("[builder] not running, build request ignored");
            return;
        }
        match self.state {
            BuilderState::Building | BuilderState::WaitingForCommit => {
                debug!("[builder] build request ignored ({:?})", self.state);
                return;
            }
            BuilderState::Idle | BuilderState::RetryScheduled => (),
        }
        self.retry = None;

        let last_block = match self.get_or_fetch_last_block() {
            Ok(block) => block,
            Err(err) => {
                error!(
                    "[builder] unable to load last block: {}",
                    err.to_string_full()
                );
                self.state = BuilderState::Idle;
                return;
            }
        };

        self.state = BuilderState::Building;
        let generation = self.generation;
        let limit = self.config.block_size_limit;
        let pool = self.pool.clone();
        let vm = self.vm.clone();
        let outcome_tx = self.outcome_tx.clone();
        task::spawn(async move {
            let result = build_block(pool, vm, limit, &last_block);
            if outcome_tx
                .try_send(BuildOutcome { generation, result })
                .is_err()
            {
                warn!("[builder] build outcome lost");
            }
        });
    }

    /// Drives the pipeline: fires the retry timer and collects build
    /// outcomes. Ready when a new block is waiting to be proposed.
    pub fn poll_ready_block(&mut self, cx: &mut Context<'_>) -> Poll<Block> {
        loop {
            if let Some(retry) = self.retry.as_mut() {
                if retry.poll_unpin(cx).is_ready() {
                    self.retry = None;
                    trace!("[builder] retry timer fired");
                    self.append_next_block();
                }
            }

            let armed = self.retry_seq;
            while let Poll::Ready(Some(outcome)) = self.outcome_rx.poll_next_unpin(cx) {
                if let Some(block) = self.on_build_outcome(outcome) {
                    return Poll::Ready(block);
                }
            }
            // A timer armed by the outcomes must be polled once.
            if armed == self.retry_seq {
                return Poll::Pending;
            }
        }
    }

    fn on_build_outcome(&mut self, outcome: BuildOutcome) -> Option<Block> {
        if outcome.generation != self.generation || !self.running {
            debug!("[builder] discarding stale build result");
            return None;
        }
        match outcome.result {
            Ok(Some(block)) => {
                info!(
                    "[builder] block {} built ({} txs)",
                    block.header.height,
                    block.body.transactions.len()
                );
                self.state = BuilderState::WaitingForCommit;
                self.candidate = Some(block.clone());
                Some(block)
            }
            Ok(None) => {
                debug!(
                    "[builder] no pending transactions, retry in {} ms",
                    self.config.poll_interval.as_millis()
                );
                self.state = BuilderState::RetryScheduled;
                self.retry = Some(Box::pin(task::sleep(self.config.poll_interval)));
                self.retry_seq += 1;
                None
            }
            Err(err) => {
                error!("[builder] block build failed: {}", err.to_string_full());
                self.state = BuilderState::Idle;
                None
            }
        }
    }

    /// Persists a block reported as committed by the replicated log.
    ///
    /// # Errors
    ///
    /// `BrokenIntegrity` if the block does not extend the last committed
    /// one, `DatabaseFault` if storage refuses it.
    pub fn commit_block(&mut self, block: Block) -> Result<()> {
        let height = block.header.height;
        if let Some(candidate) = &self.candidate {
            if candidate.header.height <= height {
                self.candidate = None;
                if self.state == BuilderState::WaitingForCommit {
                    self.state = BuilderState::Idle;
                }
            }
        }

        let last_block = self.get_or_fetch_last_block()?;
        if !block.extends(&last_block) {
            return Err(Error::new_ext(
                ErrorKind::BrokenIntegrity,
                format!(
                    "block {} does not follow block {}",
                    height, last_block.header.height
                ),
            ));
        }

        let hashes: Vec<Hash> = block
            .body
            .transactions
            .iter()
            .map(|tx| TransactionEntry::new(tx.clone()).tx_hash)
            .collect();

        self.storage
            .write()
            .add_block(block.clone())
            .map_err(|err| Error::new_ext(ErrorKind::DatabaseFault, err))?;
        self.last_block = Some(block);
        info!("[builder] block {} committed", height);

        if let Err(err) = self.pool.write().mark_committed(&hashes) {
            warn!(
                "[builder] pool not updated after block {}: {}",
                height,
                err.to_string_full()
            );
        }
        Ok(())
    }

    /// Drops the waiting candidate and any in-flight build.
    pub fn discard_candidate(&mut self) {
        if self.candidate.take().is_some() || self.state != BuilderState::Idle {
            debug!("[builder] candidate discarded ({:?})", self.state);
        }
        self.retry = None;
        self.generation += 1;
        self.state = BuilderState::Idle;
    }

    /// Last committed block, from cache or storage.
    pub fn get_or_fetch_last_block(&mut self) -> Result<Block> {
        if let Some(block) = &self.last_block {
            return Ok(block.clone());
        }
        let block = self.storage.read().get_last_block()?;
        self.last_block = Some(block.clone());
        Ok(block)
    }

    /// Committed blocks starting from `from_height`, `None` on storage failure.
    pub fn get_blocks(&self, from_height: u64) -> Option<Vec<Block>> {
        match self.storage.read().get_blocks(from_height) {
            Ok(blocks) => Some(blocks),
            Err(err) => {
                warn!("[builder] get blocks failure: {}", err.to_string_full());
                None
            }
        }
    }
}

fn build_block<P: TransactionPool, V: Vm>(
    pool: Arc<RwLock<P>>,
    vm: Arc<Mutex<V>>,
    limit: usize,
    last_block: &Block,
) -> Result<Option<Block>> {
    let mut entries = pool.read().get_all_pending_transactions()?;
    entries.truncate(limit);
    if entries.is_empty() {
        return Ok(None);
    }

    let execution = vm
        .lock()
        .process_transaction_set(&entries)
        .map_err(|err| match err.kind {
            ErrorKind::ExecutionFault => err,
            _ => Error::new_ext(ErrorKind::ExecutionFault, err),
        })?;

    let transactions = entries.into_iter().map(|entry| entry.transaction).collect();
    let block = Block::next(last_block, transactions, execution, timestamp());
    Ok(Some(block))
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::schema::{
            tests::{create_test_execution, create_test_transaction},
            ExecutionResult,
        },
        blockchain::pool::MemoryPool,
        db::{MemoryDb, MockBlockStorage},
        wm::MockVm,
    };
    use async_std::future;
    use futures::future::poll_fn;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    fn create_vm(calls: Arc<AtomicUsize>, delay: Duration) -> MockVm {
        let mut vm = MockVm::new();
        vm.expect_process_transaction_set().returning(move |entries| {
            calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(delay);
            Ok(create_test_execution(entries))
        });
        vm
    }

    fn create_builder<S: BlockStorage>(
        pool: Arc<RwLock<MemoryPool>>,
        vm: MockVm,
        storage: S,
    ) -> BlockBuilder<MemoryPool, MockVm, S> {
        let config = BuilderConfig {
            poll_interval: POLL_INTERVAL,
            block_size_limit: 2,
        };
        let mut builder = BlockBuilder::new(
            config,
            pool,
            Arc::new(Mutex::new(vm)),
            Arc::new(RwLock::new(storage)),
        );
        builder.start();
        builder
    }

    fn wait_block<S: BlockStorage>(
        builder: &mut BlockBuilder<MemoryPool, MockVm, S>,
        timeout: Duration,
    ) -> Option<Block> {
        let fut = poll_fn(|cx| builder.poll_ready_block(cx));
        task::block_on(future::timeout(timeout, fut)).ok()
    }

    fn put_transactions(pool: &Arc<RwLock<MemoryPool>>, count: u8) -> Vec<TransactionEntry> {
        (0..count)
            .map(|i| {
                let entry = create_test_transaction("alice", i);
                pool.write().put_transaction(entry.transaction.clone());
                entry
            })
            .collect()
    }

    #[test]
    fn idle_pool_schedules_retry() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let vm = create_vm(calls.clone(), Duration::ZERO);
        let mut builder = create_builder(pool.clone(), vm, MemoryDb::new());

        builder.append_next_block();
        let block = wait_block(&mut builder, POLL_INTERVAL / 2);

        assert!(block.is_none());
        assert_eq!(builder.state(), BuilderState::RetryScheduled);
        assert!(builder.retry_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let entries = put_transactions(&pool, 1);
        let block = wait_block(&mut builder, 10 * POLL_INTERVAL).unwrap();

        assert_eq!(block.header.height, 1);
        assert_eq!(block.body.transactions, vec![entries[0].transaction.clone()]);
        assert_eq!(builder.state(), BuilderState::WaitingForCommit);
        assert!(!builder.retry_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn block_size_is_capped() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        let entries = put_transactions(&pool, 3);
        let vm = create_vm(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let mut builder = create_builder(pool, vm, MemoryDb::new());

        builder.append_next_block();
        let block = wait_block(&mut builder, Duration::from_secs(1)).unwrap();

        let expected: Vec<_> = entries[..2].iter().map(|e| e.transaction.clone()).collect();
        assert_eq!(block.body.transactions, expected);
        assert_eq!(block.body.transaction_receipts.len(), 2);
    }

    #[test]
    fn zero_size_cap_never_builds_empty_blocks() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        put_transactions(&pool, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let vm = create_vm(calls.clone(), Duration::ZERO);
        let config = BuilderConfig {
            poll_interval: POLL_INTERVAL,
            block_size_limit: 0,
        };
        let mut builder = BlockBuilder::new(
            config,
            pool,
            Arc::new(Mutex::new(vm)),
            Arc::new(RwLock::new(MemoryDb::new())),
        );
        builder.start();

        builder.append_next_block();
        let block = wait_block(&mut builder, POLL_INTERVAL / 2);

        assert!(block.is_none());
        assert_eq!(builder.state(), BuilderState::RetryScheduled);
        assert!(builder.candidate().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_build_guard() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        put_transactions(&pool, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let vm = create_vm(calls.clone(), Duration::from_millis(100));
        let mut builder = create_builder(pool, vm, MemoryDb::new());

        builder.append_next_block();
        builder.append_next_block();
        let block = wait_block(&mut builder, Duration::from_secs(1));
        builder.append_next_block();
        let duplicate = wait_block(&mut builder, Duration::from_millis(300));

        assert_eq!(block.unwrap().header.height, 1);
        assert!(duplicate.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn commit_while_retry_pending_builds_once() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let vm = create_vm(calls.clone(), Duration::ZERO);
        let mut builder = create_builder(pool.clone(), vm, MemoryDb::new());
        builder.append_next_block();
        assert!(wait_block(&mut builder, POLL_INTERVAL / 2).is_none());
        assert!(builder.retry_pending());

        let committed = Block::next(&Block::genesis(), vec![], ExecutionResult::default(), 1);
        builder.commit_block(committed).unwrap();
        put_transactions(&pool, 1);
        builder.append_next_block();
        let block = wait_block(&mut builder, Duration::from_secs(1)).unwrap();
        let duplicate = wait_block(&mut builder, 3 * POLL_INTERVAL);

        assert_eq!(block.header.height, 2);
        assert!(duplicate.is_none());
        assert!(!builder.retry_pending());
        assert_eq!(builder.state(), BuilderState::WaitingForCommit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn committed_heights_are_monotonic() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        let vm = create_vm(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let mut builder = create_builder(pool.clone(), vm, MemoryDb::new());

        for expected in 1..=3 {
            put_transactions(&pool, 1);
            builder.append_next_block();
            let block = wait_block(&mut builder, Duration::from_secs(1)).unwrap();
            builder.commit_block(block).unwrap();

            let last = builder.get_or_fetch_last_block().unwrap();
            assert_eq!(last.header.height, expected);
            assert_eq!(builder.state(), BuilderState::Idle);
        }
        assert!(pool.read().is_empty());
        let heights: Vec<u64> = builder
            .get_blocks(0)
            .unwrap()
            .iter()
            .map(|b| b.header.height)
            .collect();
        assert_eq!(heights, vec![0, 1, 2, 3]);
    }

    #[test]
    fn out_of_sequence_commit_is_skipped() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        let vm = create_vm(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let mut builder = create_builder(pool, vm, MemoryDb::new());
        let genesis = Block::genesis();
        let first = Block::next(&genesis, vec![], ExecutionResult::default(), 1);
        let second = Block::next(&genesis, vec![], ExecutionResult::default(), 2);

        builder.commit_block(first.clone()).unwrap();
        let err = builder.commit_block(second).unwrap_err();

        assert_eq!(err.kind, ErrorKind::BrokenIntegrity);
        assert_eq!(builder.get_or_fetch_last_block().unwrap(), first);
    }

    #[test]
    fn storage_failure_on_commit() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        let vm = create_vm(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let mut storage = MockBlockStorage::new();
        storage
            .expect_get_last_block()
            .times(1)
            .returning(|| Ok(Block::genesis()));
        storage
            .expect_add_block()
            .returning(|_| Err(Error::new(ErrorKind::Other)));
        let mut builder = create_builder(pool, vm, storage);
        let block = Block::next(&Block::genesis(), vec![], ExecutionResult::default(), 1);

        let err = builder.commit_block(block).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DatabaseFault);
        assert_eq!(builder.get_or_fetch_last_block().unwrap(), Block::genesis());
    }

    #[test]
    fn execution_failure_ends_cycle() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        put_transactions(&pool, 1);
        let mut vm = MockVm::new();
        vm.expect_process_transaction_set()
            .returning(|_| Err(Error::new(ErrorKind::ExecutionFault)));
        let mut builder = create_builder(pool, vm, MemoryDb::new());

        builder.append_next_block();
        let block = wait_block(&mut builder, 3 * POLL_INTERVAL);

        assert!(block.is_none());
        assert_eq!(builder.state(), BuilderState::Idle);
        assert!(!builder.retry_pending());
    }

    #[test]
    fn stop_discards_inflight_build() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        put_transactions(&pool, 1);
        let vm = create_vm(Arc::new(AtomicUsize::new(0)), Duration::from_millis(100));
        let mut builder = create_builder(pool, vm, MemoryDb::new());

        builder.append_next_block();
        builder.stop();
        builder.start();
        let block = wait_block(&mut builder, Duration::from_millis(300));

        assert!(block.is_none());
        assert_eq!(builder.state(), BuilderState::Idle);
    }

    #[test]
    fn discard_candidate_allows_rebuild() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        put_transactions(&pool, 1);
        let vm = create_vm(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let mut builder = create_builder(pool, vm, MemoryDb::new());
        builder.append_next_block();
        let first = wait_block(&mut builder, Duration::from_secs(1)).unwrap();

        builder.discard_candidate();
        builder.append_next_block();
        let second = wait_block(&mut builder, Duration::from_secs(1)).unwrap();

        assert!(builder.candidate().is_some());
        assert_eq!(first.header.height, second.header.height);
    }

    #[test]
    fn last_block_fetched_once() {
        let pool = Arc::new(RwLock::new(MemoryPool::new()));
        let vm = create_vm(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let mut storage = MockBlockStorage::new();
        storage
            .expect_get_last_block()
            .times(1)
            .returning(|| Ok(Block::genesis()));
        let mut builder = create_builder(pool, vm, storage);

        builder.get_or_fetch_last_block().unwrap();
        let block = builder.get_or_fetch_last_block().unwrap();

        assert_eq!(block, Block::genesis());
    }
}
