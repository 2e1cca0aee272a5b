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

//! Transaction execution interface.
//!
//! Execution semantics belong to the virtual machine implementation; the
//! block builder only needs receipts and the resulting state diff.

use crate::{
    base::schema::{ExecutionResult, TransactionEntry},
    Result,
};

#[cfg(test)]
use mockall::automock;

/// Virtual machine trait.
#[cfg_attr(test, automock)]
pub trait Vm: Send + 'static {
    /// Executes the ordered transaction set.
    ///
    /// # Errors
    ///
    /// `ExecutionFault` if the set cannot be processed as a whole.
    fn process_transaction_set(
        &mut self,
        transactions: &[TransactionEntry],
    ) -> Result<ExecutionResult>;
}
