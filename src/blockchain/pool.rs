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

//! Pending transactions pool.
//!
//! The block builder only consumes the pool through [TransactionPool]; the
//! in-memory [MemoryPool] is what a single process node (and the tests) use.

use crate::{
    base::{
        queue_set::QueueSet,
        schema::{Transaction, TransactionEntry},
    },
    crypto::Hash,
    Result,
};

#[cfg(test)]
use mockall::automock;

/// Transaction pool as seen by the block production pipeline.
#[cfg_attr(test, automock)]
pub trait TransactionPool: Send + Sync + 'static {
    /// Pending transactions, in arrival order.
    fn get_all_pending_transactions(&self) -> Result<Vec<TransactionEntry>>;

    /// Drops transactions included in a committed block.
    fn mark_committed(&mut self, hashes: &[Hash]) -> Result<()>;
}

/// Pool of outstanding transactions, kept in memory.
#[derive(Default)]
pub struct MemoryPool {
    pending: QueueSet<Hash, TransactionEntry>,
}

impl MemoryPool {
    pub fn new() -> Self {
        MemoryPool::default()
    }

    /// Adds a transaction. Returns its hash, or `None` if already pending.
    pub fn put_transaction(&mut self, transaction: Transaction) -> Option<Hash> {
        let entry = TransactionEntry::new(transaction);
        let hash = entry.tx_hash;
        match self.pending.push(hash, entry) {
            true => Some(hash),
            false => None,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl TransactionPool for MemoryPool {
    fn get_all_pending_transactions(&self) -> Result<Vec<TransactionEntry>> {
        Ok(self.pending.values().cloned().collect())
    }

    fn mark_committed(&mut self, hashes: &[Hash]) -> Result<()> {
        let removed = self.pending.remove_all(hashes);
        debug!(
            "[builder] {} committed transactions removed from pool ({} pending)",
            removed,
            self.pending.len()
        );
        Ok(())
    }
}
