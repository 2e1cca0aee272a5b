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

//! Durable block storage interface.

use crate::{base::schema::Block, Result};

#[cfg(test)]
use mockall::automock;

pub mod memory;

pub use memory::MemoryDb;

/// Block storage as seen by the block production pipeline.
#[cfg_attr(test, automock)]
pub trait BlockStorage: Send + Sync + 'static {
    /// Last stored block.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if the storage is empty, `DatabaseFault` on
    /// storage failure.
    fn get_last_block(&self) -> Result<Block>;

    /// Stored blocks with height greater or equal to `from_height`, in
    /// height order.
    fn get_blocks(&self, from_height: u64) -> Result<Vec<Block>>;

    /// Appends a committed block.
    fn add_block(&mut self, block: Block) -> Result<()>;
}
