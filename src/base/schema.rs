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

//! Ledger data model shared by the gossip, consensus and block production
//! subsystems.

use crate::crypto::{Hash, Hashable};

/// Current block structure version.
pub const BLOCK_VERSION: u8 = 1;

/// Application transaction.
///
/// The node core never interprets the payload; execution is delegated to the
/// virtual machine.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Transaction {
    /// Submitter account identifier.
    pub sender: String,
    /// Submission time in milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Opaque execution arguments.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Pooled transaction together with its hash.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TransactionEntry {
    pub transaction: Transaction,
    pub tx_hash: Hash,
}

impl TransactionEntry {
    /// Wraps a transaction computing its hash.
    pub fn new(transaction: Transaction) -> Self {
        let tx_hash = transaction.hash();
        TransactionEntry {
            transaction,
            tx_hash,
        }
    }
}

/// Outcome of a single transaction execution.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TransactionReceipt {
    /// Hash of the executed transaction.
    pub tx_hash: Hash,
    /// Execution result.
    pub success: bool,
    /// Opaque returned data (or error message).
    #[serde(with = "serde_bytes")]
    pub returns: Vec<u8>,
}

/// Single key change produced by a transaction set execution.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct StateDiffEntry {
    pub contract: String,
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

/// Virtual machine output for an ordered transaction set.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct ExecutionResult {
    pub transaction_receipts: Vec<TransactionReceipt>,
    pub state_diff: Vec<StateDiffEntry>,
}

/// Block header.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct BlockHeader {
    /// Structure version.
    pub version: u8,
    /// Index in the blockchain, which is also the number of ancestors blocks.
    pub height: u64,
    /// Previous block hash.
    pub prev_hash: Hash,
    /// Digest of the block transactions.
    pub txs_hash: Hash,
    /// Digest of the block receipts.
    pub rxs_hash: Hash,
    /// Digest of the state diff.
    pub state_hash: Hash,
    /// Build time in milliseconds since the unix epoch.
    pub timestamp: u64,
}

/// Block body.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub transaction_receipts: Vec<TransactionReceipt>,
    pub state_diff: Vec<StateDiffEntry>,
}

/// Block structure.
/// Its hash is computed over the MessagePack serialization of the whole
/// structure (header and body).
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Block at height zero, shared by every node of a fresh network.
    pub fn genesis() -> Self {
        let body = BlockBody::default();
        Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height: 0,
                prev_hash: Hash::default(),
                txs_hash: body.transactions.hash(),
                rxs_hash: body.transaction_receipts.hash(),
                state_hash: body.state_diff.hash(),
                timestamp: 0,
            },
            body,
        }
    }

    /// Assembles the block following `prev`.
    pub fn next(
        prev: &Block,
        transactions: Vec<Transaction>,
        execution: ExecutionResult,
        timestamp: u64,
    ) -> Self {
        let body = BlockBody {
            transactions,
            transaction_receipts: execution.transaction_receipts,
            state_diff: execution.state_diff,
        };
        Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height: prev.header.height + 1,
                prev_hash: prev.hash(),
                txs_hash: body.transactions.hash(),
                rxs_hash: body.transaction_receipts.hash(),
                state_hash: body.state_diff.hash(),
                timestamp,
            },
            body,
        }
    }

    /// Checks that this block directly extends `prev`.
    pub fn extends(&self, prev: &Block) -> bool {
        self.header.height == prev.header.height + 1 && self.header.prev_hash == prev.hash()
    }
}

/// Replicated log entry payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ConsensusMessage {
    pub block: Block,
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn create_test_transaction(sender: &str, nonce: u8) -> TransactionEntry {
        TransactionEntry::new(Transaction {
            sender: sender.to_string(),
            timestamp: 1_600_000_000_000 + nonce as u64,
            payload: vec![nonce],
        })
    }

    pub fn create_test_execution(entries: &[TransactionEntry]) -> ExecutionResult {
        ExecutionResult {
            transaction_receipts: entries
                .iter()
                .map(|entry| TransactionReceipt {
                    tx_hash: entry.tx_hash,
                    success: true,
                    returns: vec![],
                })
                .collect(),
            state_diff: vec![],
        }
    }

    #[test]
    fn genesis_is_stable() {
        let a = Block::genesis();
        let b = Block::genesis();

        assert_eq!(a.header.height, 0);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn next_block_links_previous() {
        let genesis = Block::genesis();
        let entries = vec![create_test_transaction("alice", 1)];
        let execution = create_test_execution(&entries);
        let txs = entries.into_iter().map(|e| e.transaction).collect();

        let block = Block::next(&genesis, txs, execution, 42);

        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.prev_hash, genesis.hash());
        assert!(block.extends(&genesis));
        assert_eq!(block.body.transaction_receipts.len(), 1);
    }

    #[test]
    fn block_does_not_extend_sibling() {
        let genesis = Block::genesis();
        let a = Block::next(&genesis, vec![], ExecutionResult::default(), 1);
        let b = Block::next(&genesis, vec![], ExecutionResult::default(), 2);

        assert!(!b.extends(&a));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn transaction_entry_hash() {
        let entry = create_test_transaction("alice", 1);

        assert_eq!(entry.tx_hash, entry.transaction.hash());
        assert_ne!(entry.tx_hash, create_test_transaction("alice", 2).tx_hash);
    }
}
