// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Ledger storage contract.
//!
//! [`Queries`] is the statement-level interface a unit of work is given.
//! [`Store`] opens units of work and offers autocommit shortcuts for
//! single-statement reads and inserts.
//!
//! Every write issued through a [`Queries`] handle becomes visible to other
//! readers only when the enclosing unit of work commits. If the closure
//! returns an error, the context is cancelled, or the backend faults, every
//! write is discarded and every row lock is released.

mod memory;

pub use memory::{FaultPoint, MemoryStore};

use crate::account::{Account, CreateAccountParams, ListAccountsParams};
use crate::base::{AccountId, EntryId, TransferId};
use crate::context::Context;
use crate::entry::{Entry, ListEntriesParams};
use crate::error::StoreError;
use crate::transfer::{ListTransfersParams, Transfer};
use std::time::Duration;

/// Row-level operations available inside a unit of work.
pub trait Queries {
    fn create_account(&mut self, params: CreateAccountParams) -> Result<Account, StoreError>;

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError>;

    /// Reads an account and holds its row write lock until the unit of
    /// work ends. Concurrent callers locking the same row block here.
    ///
    /// Calling it again for a row this unit of work already holds returns
    /// immediately.
    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError>;

    /// Overwrites the balance, locking the row first if it is not held yet.
    fn update_account_balance(
        &mut self,
        id: AccountId,
        balance: i64,
    ) -> Result<Account, StoreError>;

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError>;

    fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer, StoreError>;

    fn get_entry(&mut self, id: EntryId) -> Result<Entry, StoreError>;

    fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, StoreError>;

    /// Accounts ordered by id.
    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StoreError>;

    /// Entries of one account ordered by id.
    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StoreError>;

    /// Transfers with the account on either side, ordered by id.
    fn list_transfers(&mut self, params: &ListTransfersParams)
    -> Result<Vec<Transfer>, StoreError>;
}

/// Durable owner of accounts, entries and transfers.
pub trait Store: Send + Sync {
    /// Runs `f` as a single atomic unit of work.
    ///
    /// The writes made by `f` commit together when it returns `Ok`, and are
    /// all rolled back otherwise.
    fn execute_in_transaction<T, E, F>(&self, ctx: &Context, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Queries) -> Result<T, E>,
        E: From<StoreError>;

    fn create_account(
        &self,
        ctx: &Context,
        params: CreateAccountParams,
    ) -> Result<Account, StoreError> {
        self.execute_in_transaction(ctx, |q| q.create_account(params))
    }

    fn get_account(&self, ctx: &Context, id: AccountId) -> Result<Account, StoreError> {
        self.execute_in_transaction(ctx, |q| q.get_account(id))
    }

    fn list_accounts(
        &self,
        ctx: &Context,
        params: &ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        self.execute_in_transaction(ctx, |q| q.list_accounts(params))
    }

    fn get_entry(&self, ctx: &Context, id: EntryId) -> Result<Entry, StoreError> {
        self.execute_in_transaction(ctx, |q| q.get_entry(id))
    }

    fn list_entries(
        &self,
        ctx: &Context,
        params: &ListEntriesParams,
    ) -> Result<Vec<Entry>, StoreError> {
        self.execute_in_transaction(ctx, |q| q.list_entries(params))
    }

    fn get_transfer(&self, ctx: &Context, id: TransferId) -> Result<Transfer, StoreError> {
        self.execute_in_transaction(ctx, |q| q.get_transfer(id))
    }

    fn list_transfers(
        &self,
        ctx: &Context,
        params: &ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.execute_in_transaction(ctx, |q| q.list_transfers(params))
    }
}

/// Tuning for row-lock waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Longest a unit of work waits for one row lock before failing with
    /// [`StoreError::LockTimeout`].
    pub lock_timeout: Duration,
    /// How often a blocked lock wait re-checks its context.
    pub lock_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            lock_poll_interval: Duration::from_millis(10),
        }
    }
}
