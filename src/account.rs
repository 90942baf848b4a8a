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

//! Account records.
//!
//! An account belongs to one owner and holds a single-currency balance in
//! minor units. The balance is only changed by the transfer engine, or set
//! once when the account is opened.
//!
//! # Example
//!
//! ```
//! use bank_ledger_rs::{Context, Currency, MemoryStore, Store, CreateAccountParams};
//!
//! let store = MemoryStore::new();
//! let account = store
//!     .create_account(&Context::background(), CreateAccountParams::new("alice", Currency::USD))
//!     .unwrap();
//! assert_eq!(account.balance, 0);
//! ```

use crate::base::{AccountId, Currency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    /// Balance in the smallest currency unit.
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Returns the balance after applying `delta`, or `None` on overflow.
    pub fn balance_after(&self, delta: i64) -> Option<i64> {
        self.balance.checked_add(delta)
    }
}

/// Fields for opening an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

impl CreateAccountParams {
    /// Opening parameters with a zero balance.
    pub fn new(owner: impl Into<String>, currency: Currency) -> Self {
        Self {
            owner: owner.into(),
            balance: 0,
            currency,
        }
    }

    /// Sets an opening balance. Used when seeding fixtures.
    pub fn with_balance(mut self, balance: i64) -> Self {
        self.balance = balance;
        self
    }
}

/// Page of accounts, optionally restricted to one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAccountsParams {
    pub owner: Option<String>,
    pub limit: usize,
    pub offset: usize,
}
