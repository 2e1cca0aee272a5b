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

//! Volatile block storage.

use super::BlockStorage;
use crate::{base::schema::Block, Error, ErrorKind, Result};

/// Blocks kept in memory, indexed by height.
pub struct MemoryDb {
    blocks: Vec<Block>,
}

impl Default for MemoryDb {
    fn default() -> Self {
        MemoryDb::new()
    }
}

impl MemoryDb {
    /// Storage seeded with the genesis block.
    pub fn new() -> Self {
        MemoryDb {
            blocks: vec![Block::genesis()],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStorage for MemoryDb {
    fn get_last_block(&self) -> Result<Block> {
        self.blocks
            .last()
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::ResourceNotFound))
    }

    fn get_blocks(&self, from_height: u64) -> Result<Vec<Block>> {
        Ok(self
            .blocks
            .iter()
            .filter(|block| block.header.height >= from_height)
            .cloned()
            .collect())
    }

    fn add_block(&mut self, block: Block) -> Result<()> {
        let expected = self.blocks.len() as u64;
        if block.header.height != expected {
            return Err(Error::new_ext(
                ErrorKind::BrokenIntegrity,
                format!(
                    "block height {}, expected {}",
                    block.header.height, expected
                ),
            ));
        }
        self.blocks.push(block);
        Ok(())
    }
}
