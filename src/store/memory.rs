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

//! Concurrent in-memory ledger store.
//!
//! Tables are [`DashMap`]s. Each account row carries its committed value
//! and a row lock owned by at most one unit of work at a time. A unit of
//! work buffers its writes and publishes them under a short global commit
//! gate. Readers therefore see either none or all of a unit of work's
//! writes.
//!
//! Sequences behave like SQL sequences: an id handed out to a unit of work
//! that later rolls back is never reused.

use super::{Queries, Store, StoreConfig};
use crate::account::{Account, CreateAccountParams, ListAccountsParams};
use crate::base::{AccountId, EntryId, TransferId};
use crate::context::Context;
use crate::entry::{Entry, ListEntriesParams};
use crate::error::StoreError;
use crate::transfer::{ListTransfersParams, Transfer};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Operations that can be made to fail on demand.
///
/// Used by tests to simulate backend faults in the middle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    GetAccountForUpdate,
    UpdateAccountBalance,
    CreateEntry,
    CreateTransfer,
    Commit,
}

/// Exclusive row lock owned by a unit of work id.
#[derive(Debug, Default)]
struct RowLock {
    holder: Mutex<Option<u64>>,
    released: Condvar,
}

impl RowLock {
    fn acquire(
        &self,
        tx_id: u64,
        account_id: AccountId,
        ctx: &Context,
        config: &StoreConfig,
    ) -> Result<(), StoreError> {
        let started = Instant::now();
        let mut holder = self.holder.lock();
        loop {
            match *holder {
                None => {
                    *holder = Some(tx_id);
                    return Ok(());
                }
                Some(current) if current == tx_id => return Ok(()),
                Some(current) => {
                    trace!(tx = tx_id, holder = current, account = %account_id, "waiting for row lock");
                }
            }

            ctx.check()?;
            let waited = started.elapsed();
            if waited >= config.lock_timeout {
                return Err(StoreError::LockTimeout { account_id });
            }

            let mut slice = config.lock_poll_interval.min(config.lock_timeout - waited);
            if let Some(remaining) = ctx.remaining() {
                slice = slice.min(remaining);
            }
            self.released.wait_for(&mut holder, slice);
        }
    }

    fn release(&self, tx_id: u64) {
        let mut holder = self.holder.lock();
        if *holder == Some(tx_id) {
            *holder = None;
            self.released.notify_all();
        }
    }
}

#[derive(Debug)]
struct AccountRow {
    committed: RwLock<Account>,
    lock: RowLock,
}

impl AccountRow {
    fn new(account: Account) -> Self {
        Self {
            committed: RwLock::new(account),
            lock: RowLock::default(),
        }
    }
}

/// In-memory [`Store`] with row-level locking and atomic commits.
#[derive(Debug)]
pub struct MemoryStore {
    config: StoreConfig,
    accounts: DashMap<AccountId, Arc<AccountRow>>,
    entries: DashMap<EntryId, Entry>,
    transfers: DashMap<TransferId, Transfer>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    tx_seq: AtomicU64,
    /// Held shared by readers and exclusively while a commit publishes.
    commit_gate: RwLock<()>,
    faults: DashSet<FaultPoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            accounts: DashMap::new(),
            entries: DashMap::new(),
            transfers: DashMap::new(),
            account_seq: AtomicI64::new(1),
            entry_seq: AtomicI64::new(1),
            transfer_seq: AtomicI64::new(1),
            tx_seq: AtomicU64::new(1),
            commit_gate: RwLock::new(()),
            faults: DashSet::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Makes every later call reaching `point` fail with a backend error.
    pub fn fail_on(&self, point: FaultPoint) {
        self.faults.insert(point);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Number of committed accounts.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Number of committed entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of committed transfers.
    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    fn inject(&self, point: FaultPoint) -> Result<(), StoreError> {
        if self.faults.contains(&point) {
            return Err(StoreError::Backend(format!("injected fault at {point:?}")));
        }
        Ok(())
    }

    fn row(&self, id: AccountId) -> Option<Arc<AccountRow>> {
        self.accounts.get(&id).map(|row| Arc::clone(row.value()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn execute_in_transaction<T, E, F>(&self, ctx: &Context, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Queries) -> Result<T, E>,
        E: From<StoreError>,
    {
        ctx.check()?;
        let mut tx = MemoryTx::begin(self, ctx);
        let tx_id = tx.id;

        let outcome = {
            let handle: &mut dyn Queries = &mut tx;
            f(handle)
        };

        match outcome {
            Ok(value) => {
                if let Err(err) = tx.commit() {
                    warn!(tx = tx_id, error = %err, "commit failed, rolled back");
                    return Err(err.into());
                }
                trace!(tx = tx_id, "committed");
                Ok(value)
            }
            Err(err) => {
                debug!(tx = tx_id, "rolled back");
                Err(err)
            }
        }
    }
}

/// One open unit of work.
///
/// Dropping it without committing discards the buffered writes and releases
/// every held row lock, including when unwinding from a panic.
struct MemoryTx<'a> {
    store: &'a MemoryStore,
    ctx: &'a Context,
    id: u64,
    held: BTreeMap<AccountId, Arc<AccountRow>>,
    accounts: BTreeMap<AccountId, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl<'a> MemoryTx<'a> {
    fn begin(store: &'a MemoryStore, ctx: &'a Context) -> Self {
        Self {
            store,
            ctx,
            id: store.tx_seq.fetch_add(1, Ordering::Relaxed),
            held: BTreeMap::new(),
            accounts: BTreeMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        }
    }

    /// Acquires the row lock for `id` unless already held.
    fn lock_row(&mut self, id: AccountId) -> Result<(), StoreError> {
        if self.held.contains_key(&id) {
            return Ok(());
        }
        let Some(row) = self.store.row(id) else {
            // Rows created by this unit of work are invisible to everyone else.
            if self.accounts.contains_key(&id) {
                return Ok(());
            }
            return Err(StoreError::NotFound {
                table: "accounts",
                id: id.0,
            });
        };

        let started = Instant::now();
        row.lock.acquire(self.id, id, self.ctx, &self.store.config)?;
        debug!(
            tx = self.id,
            account = %id,
            waited_us = started.elapsed().as_micros() as u64,
            "row lock acquired"
        );
        self.held.insert(id, row);
        Ok(())
    }

    /// Own pending value if any, committed value otherwise.
    fn current(&self, id: AccountId) -> Result<Account, StoreError> {
        if let Some(account) = self.accounts.get(&id) {
            return Ok(account.clone());
        }
        let _gate = self.store.commit_gate.read();
        self.store
            .row(id)
            .map(|row| row.committed.read().clone())
            .ok_or(StoreError::NotFound {
                table: "accounts",
                id: id.0,
            })
    }

    fn account_exists(&self, id: AccountId) -> bool {
        self.accounts.contains_key(&id) || self.store.accounts.contains_key(&id)
    }

    fn statement(&self, point: Option<FaultPoint>) -> Result<(), StoreError> {
        self.ctx.check()?;
        match point {
            Some(point) => self.store.inject(point),
            None => Ok(()),
        }
    }

    fn has_writes(&self) -> bool {
        !(self.accounts.is_empty() && self.entries.is_empty() && self.transfers.is_empty())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        if !self.has_writes() {
            return Ok(());
        }
        self.store.inject(FaultPoint::Commit)?;
        self.ctx.check()?;

        let accounts = mem::take(&mut self.accounts);
        let entries = mem::take(&mut self.entries);
        let transfers = mem::take(&mut self.transfers);

        let _gate = self.store.commit_gate.write();
        for (id, account) in accounts {
            match self.store.row(id) {
                Some(row) => *row.committed.write() = account,
                None => {
                    self.store.accounts.insert(id, Arc::new(AccountRow::new(account)));
                }
            }
        }
        for entry in entries {
            self.store.entries.insert(entry.id, entry);
        }
        for transfer in transfers {
            self.store.transfers.insert(transfer.id, transfer);
        }
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        for (_, row) in mem::take(&mut self.held) {
            row.lock.release(self.id);
        }
    }
}

fn check_balance(balance: i64) -> Result<(), StoreError> {
    if balance < 0 {
        return Err(StoreError::CheckViolation {
            table: "accounts",
            column: "balance",
            value: balance,
        });
    }
    Ok(())
}

fn page<T>(items: impl Iterator<Item = T>, offset: usize, limit: usize) -> Vec<T> {
    items.skip(offset).take(limit).collect()
}

impl Queries for MemoryTx<'_> {
    fn create_account(&mut self, params: CreateAccountParams) -> Result<Account, StoreError> {
        self.statement(None)?;
        check_balance(params.balance)?;
        let account = Account {
            id: AccountId(self.store.account_seq.fetch_add(1, Ordering::Relaxed)),
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.statement(None)?;
        self.current(id)
    }

    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.statement(Some(FaultPoint::GetAccountForUpdate))?;
        self.lock_row(id)?;
        self.current(id)
    }

    fn update_account_balance(
        &mut self,
        id: AccountId,
        balance: i64,
    ) -> Result<Account, StoreError> {
        self.statement(Some(FaultPoint::UpdateAccountBalance))?;
        check_balance(balance)?;
        self.lock_row(id)?;
        let mut account = self.current(id)?;
        account.balance = balance;
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        self.statement(Some(FaultPoint::CreateEntry))?;
        if !self.account_exists(account_id) {
            return Err(StoreError::ForeignKeyViolation {
                table: "entries",
                id: account_id.0,
            });
        }
        let entry = Entry {
            id: EntryId(self.store.entry_seq.fetch_add(1, Ordering::Relaxed)),
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer, StoreError> {
        self.statement(Some(FaultPoint::CreateTransfer))?;
        for id in [from_account_id, to_account_id] {
            if !self.account_exists(id) {
                return Err(StoreError::ForeignKeyViolation {
                    table: "transfers",
                    id: id.0,
                });
            }
        }
        let transfer = Transfer {
            id: TransferId(self.store.transfer_seq.fetch_add(1, Ordering::Relaxed)),
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    fn get_entry(&mut self, id: EntryId) -> Result<Entry, StoreError> {
        self.statement(None)?;
        if let Some(entry) = self.entries.iter().find(|entry| entry.id == id) {
            return Ok(entry.clone());
        }
        let _gate = self.store.commit_gate.read();
        self.store
            .entries
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound {
                table: "entries",
                id: id.0,
            })
    }

    fn get_transfer(&mut self, id: TransferId) -> Result<Transfer, StoreError> {
        self.statement(None)?;
        if let Some(transfer) = self.transfers.iter().find(|transfer| transfer.id == id) {
            return Ok(transfer.clone());
        }
        let _gate = self.store.commit_gate.read();
        self.store
            .transfers
            .get(&id)
            .map(|transfer| transfer.value().clone())
            .ok_or(StoreError::NotFound {
                table: "transfers",
                id: id.0,
            })
    }

    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StoreError> {
        self.statement(None)?;
        let mut rows: BTreeMap<AccountId, Account> = {
            let _gate = self.store.commit_gate.read();
            self.store
                .accounts
                .iter()
                .map(|row| (*row.key(), row.committed.read().clone()))
                .collect()
        };
        for (id, account) in &self.accounts {
            rows.insert(*id, account.clone());
        }

        let matching = rows.into_values().filter(|account| {
            params
                .owner
                .as_deref()
                .is_none_or(|owner| account.owner == owner)
        });
        Ok(page(matching, params.offset, params.limit))
    }

    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        self.statement(None)?;
        let mut rows: BTreeMap<EntryId, Entry> = {
            let _gate = self.store.commit_gate.read();
            self.store
                .entries
                .iter()
                .filter(|entry| entry.account_id == params.account_id)
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect()
        };
        for entry in self.entries.iter().filter(|e| e.account_id == params.account_id) {
            rows.insert(entry.id, entry.clone());
        }
        Ok(page(rows.into_values(), params.offset, params.limit))
    }

    fn list_transfers(
        &mut self,
        params: &ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.statement(None)?;
        let touches = |transfer: &Transfer| {
            transfer.from_account_id == params.account_id
                || transfer.to_account_id == params.account_id
        };
        let mut rows: BTreeMap<TransferId, Transfer> = {
            let _gate = self.store.commit_gate.read();
            self.store
                .transfers
                .iter()
                .filter(|transfer| touches(transfer.value()))
                .map(|transfer| (*transfer.key(), transfer.value().clone()))
                .collect()
        };
        for transfer in self.transfers.iter().filter(|t| touches(t)) {
            rows.insert(transfer.id, transfer.clone());
        }
        Ok(page(rows.into_values(), params.offset, params.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Currency;
    use std::time::Duration;

    fn seeded(balances: &[i64]) -> (MemoryStore, Vec<AccountId>) {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let ids = balances
            .iter()
            .map(|balance| {
                store
                    .create_account(
                        &ctx,
                        CreateAccountParams::new("owner", Currency::USD).with_balance(*balance),
                    )
                    .unwrap()
                    .id
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn row_lock_is_reentrant_for_holder() {
        let lock = RowLock::default();
        let ctx = Context::background();
        let config = StoreConfig::default();
        lock.acquire(1, AccountId(1), &ctx, &config).unwrap();
        lock.acquire(1, AccountId(1), &ctx, &config).unwrap();
        assert_eq!(*lock.holder.lock(), Some(1));
    }

    #[test]
    fn row_lock_times_out_for_other_holder() {
        let lock = RowLock::default();
        let ctx = Context::background();
        let config = StoreConfig {
            lock_timeout: Duration::from_millis(20),
            lock_poll_interval: Duration::from_millis(5),
        };
        lock.acquire(1, AccountId(4), &ctx, &config).unwrap();
        assert_eq!(
            lock.acquire(2, AccountId(4), &ctx, &config),
            Err(StoreError::LockTimeout {
                account_id: AccountId(4)
            })
        );
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let lock = RowLock::default();
        let ctx = Context::background();
        lock.acquire(1, AccountId(1), &ctx, &StoreConfig::default())
            .unwrap();
        lock.release(2);
        assert_eq!(*lock.holder.lock(), Some(1));
        lock.release(1);
        assert_eq!(*lock.holder.lock(), None);
    }

    #[test]
    fn dropped_unit_of_work_releases_locks() {
        let (store, ids) = seeded(&[10]);
        let ctx = Context::background();
        let result: Result<(), StoreError> = store.execute_in_transaction(&ctx, |q| {
            q.get_account_for_update(ids[0])?;
            Err(StoreError::Backend("boom".into()))
        });
        assert!(result.is_err());

        let row = store.row(ids[0]).unwrap();
        assert_eq!(*row.lock.holder.lock(), None);
    }

    #[test]
    fn uncommitted_writes_are_invisible_to_other_readers() {
        let (store, ids) = seeded(&[10]);
        let ctx = Context::background();
        store
            .execute_in_transaction(&ctx, |q| -> Result<(), StoreError> {
                q.update_account_balance(ids[0], 99)?;
                assert_eq!(q.get_account(ids[0])?.balance, 99);
                assert_eq!(store.get_account(&ctx, ids[0])?.balance, 10);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get_account(&ctx, ids[0]).unwrap().balance, 99);
    }

    #[test]
    fn sequences_are_not_reused_after_rollback() {
        let (store, ids) = seeded(&[10]);
        let ctx = Context::background();
        let rolled_back: Result<Entry, StoreError> = store.execute_in_transaction(&ctx, |q| {
            let entry = q.create_entry(ids[0], 5)?;
            assert_eq!(entry.id, EntryId(1));
            Err(StoreError::Backend("abort".into()))
        });
        assert!(rolled_back.is_err());

        let entry = store
            .execute_in_transaction(&ctx, |q| q.create_entry(ids[0], 5))
            .unwrap();
        assert_eq!(entry.id, EntryId(2));
        assert_eq!(store.entry_count(), 1);
    }
}
