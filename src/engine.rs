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

//! Money transfer engine.
//!
//! The [`Engine`] moves funds between two accounts as one atomic unit of
//! work. It writes two balance updates, a debit entry, a credit entry and
//! a transfer record. Either all five are committed or none are.
//!
//! # Locking
//!
//! Both account rows are locked with `get_account_for_update` before any
//! balance is read for real. The row with the smaller [`AccountId`] is always
//! locked first, whichever side is debited. Two transfers over the same pair
//! of accounts, in either direction, therefore request locks in the same
//! order and can never wait on each other in a cycle.
//!
//! # Thread Safety
//!
//! The engine keeps no per-call state. One instance can be shared across any
//! number of threads; transfers on disjoint accounts proceed in parallel and
//! transfers sharing an account are serialized by the store's row locks.

use crate::account::Account;
use crate::base::AccountId;
use crate::context::Context;
use crate::error::{StoreError, TransferError};
use crate::store::{Queries, Store};
use crate::transfer::{AccountRole, TransferParams, TransferResult};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

type AfterCommitHook = Arc<dyn Fn(&TransferResult) + Send + Sync>;

/// Transfer engine over a [`Store`].
pub struct Engine<S> {
    store: Arc<S>,
    after_commit: Vec<AfterCommitHook>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Engine {
            store,
            after_commit: Vec::new(),
        }
    }

    /// Registers a callback invoked with every committed transfer.
    ///
    /// Hooks run on the caller's thread after the unit of work has committed
    /// and its locks are released. They never run for a failed transfer.
    pub fn with_after_commit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TransferResult) + Send + Sync + 'static,
    {
        self.after_commit.push(Arc::new(hook));
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Moves `params.amount` from one account to another.
    ///
    /// # Errors
    ///
    /// - [`TransferError::InvalidAmount`] - Amount is zero or negative.
    /// - [`TransferError::SameAccount`] - Source and destination are equal.
    /// - [`TransferError::AccountNotFound`] - Either account does not exist.
    /// - [`TransferError::InsufficientFunds`] - Source balance is below the amount.
    /// - [`TransferError::CurrencyMismatch`] - An account is not in the requested currency.
    /// - [`TransferError::BalanceOverflow`] - Destination balance would overflow.
    /// - [`TransferError::Storage`] - Backend fault or lock timeout; nothing was written.
    /// - [`TransferError::Cancelled`] - Context cancelled or expired; nothing was written.
    #[instrument(
        skip_all,
        fields(
            from = %params.from_account_id,
            to = %params.to_account_id,
            amount = params.amount,
            currency = %params.currency,
        )
    )]
    pub fn transfer(
        &self,
        ctx: &Context,
        params: TransferParams,
    ) -> Result<TransferResult, TransferError> {
        validate_params(&params)?;

        // Unlocked snapshot to reject obviously bad requests without taking
        // row locks. Everything is checked again under the locks.
        let from = self.load(ctx, params.from_account_id, AccountRole::From)?;
        let to = self.load(ctx, params.to_account_id, AccountRole::To)?;
        check_accounts(&params, &from, &to)?;

        let result = self
            .store
            .execute_in_transaction(ctx, |q| transfer_tx(q, &params))
            .inspect_err(|err| warn!(error = %err, "transfer rolled back"))?;

        info!(transfer = %result.transfer.id, "transfer committed");
        for hook in &self.after_commit {
            hook(&result);
        }
        Ok(result)
    }

    fn load(
        &self,
        ctx: &Context,
        account_id: AccountId,
        which: AccountRole,
    ) -> Result<Account, TransferError> {
        self.store
            .get_account(ctx, account_id)
            .map_err(|err| not_found_as(err, account_id, which))
    }
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Engine {
            store: Arc::clone(&self.store),
            after_commit: self.after_commit.clone(),
        }
    }
}

impl<S> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("after_commit_hooks", &self.after_commit.len())
            .finish_non_exhaustive()
    }
}

/// Order in which the two rows of a transfer are locked.
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b { (a, b) } else { (b, a) }
}

fn validate_params(params: &TransferParams) -> Result<(), TransferError> {
    if params.amount <= 0 {
        return Err(TransferError::InvalidAmount);
    }
    if params.from_account_id == params.to_account_id {
        return Err(TransferError::SameAccount);
    }
    Ok(())
}

fn check_accounts(
    params: &TransferParams,
    from: &Account,
    to: &Account,
) -> Result<(), TransferError> {
    if from.balance < params.amount {
        return Err(TransferError::InsufficientFunds {
            account_id: from.id,
            balance: from.balance,
            requested: params.amount,
        });
    }
    for (which, account) in [(AccountRole::From, from), (AccountRole::To, to)] {
        if account.currency != params.currency {
            return Err(TransferError::CurrencyMismatch {
                which,
                account_id: account.id,
                expected: params.currency,
                actual: account.currency,
            });
        }
    }
    Ok(())
}

fn not_found_as(err: StoreError, account_id: AccountId, which: AccountRole) -> TransferError {
    if err.is_not_found() {
        TransferError::AccountNotFound { which, account_id }
    } else {
        err.into()
    }
}

fn lock_account(
    q: &mut dyn Queries,
    account_id: AccountId,
    which: AccountRole,
) -> Result<Account, TransferError> {
    q.get_account_for_update(account_id)
        .map_err(|err| not_found_as(err, account_id, which))
}

/// Locks both rows in [`lock_order`] and returns them as `(from, to)`.
fn lock_pair(
    q: &mut dyn Queries,
    params: &TransferParams,
) -> Result<(Account, Account), TransferError> {
    let (first, _) = lock_order(params.from_account_id, params.to_account_id);
    if first == params.from_account_id {
        let from = lock_account(q, params.from_account_id, AccountRole::From)?;
        let to = lock_account(q, params.to_account_id, AccountRole::To)?;
        Ok((from, to))
    } else {
        let to = lock_account(q, params.to_account_id, AccountRole::To)?;
        let from = lock_account(q, params.from_account_id, AccountRole::From)?;
        Ok((from, to))
    }
}

fn transfer_tx(
    q: &mut dyn Queries,
    params: &TransferParams,
) -> Result<TransferResult, TransferError> {
    let (from, to) = lock_pair(q, params)?;
    // The balance may have moved since the unlocked read.
    check_accounts(params, &from, &to)?;

    let amount = params.amount;
    let from_balance = from
        .balance_after(-amount)
        .ok_or(TransferError::BalanceOverflow { account_id: from.id })?;
    let to_balance = to
        .balance_after(amount)
        .ok_or(TransferError::BalanceOverflow { account_id: to.id })?;

    let from_account = q.update_account_balance(from.id, from_balance)?;
    let to_account = q.update_account_balance(to.id, to_balance)?;
    let from_entry = q.create_entry(from.id, -amount)?;
    let to_entry = q.create_entry(to.id, amount)?;
    let transfer = q.create_transfer(from.id, to.id, amount)?;

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}
