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

//! # Bank Ledger
//!
//! This library provides the ledger core of a banking backend: accounts,
//! append-only entries, and an engine that transfers money between two
//! accounts atomically and without deadlocks.
//!
//! ## Core Components
//!
//! - [`Engine`]: Transfer engine running each transfer as one unit of work
//! - [`Store`] / [`Queries`]: Storage contract with row locks and atomic commits
//! - [`MemoryStore`]: Concurrent in-memory store
//! - [`BankService`]: Request façade enforcing ownership and input rules
//! - [`TransferError`]: Error types for transfer failures
//!
//! ## Example
//!
//! ```
//! use bank_ledger_rs::{
//!     AccountId, Context, CreateAccountParams, Currency, Engine, MemoryStore, Store,
//!     TransferParams,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let ctx = Context::background();
//! let alice = store
//!     .create_account(&ctx, CreateAccountParams::new("alice", Currency::USD).with_balance(100))
//!     .unwrap();
//! let bob = store
//!     .create_account(&ctx, CreateAccountParams::new("bob", Currency::USD).with_balance(50))
//!     .unwrap();
//!
//! let engine = Engine::new(Arc::clone(&store));
//! let result = engine
//!     .transfer(
//!         &ctx,
//!         TransferParams {
//!             from_account_id: alice.id,
//!             to_account_id: bob.id,
//!             amount: 30,
//!             currency: Currency::USD,
//!         },
//!     )
//!     .unwrap();
//!
//! assert_eq!(result.from_account.balance, 70);
//! assert_eq!(result.to_account.balance, 80);
//! assert_eq!(result.from_entry.amount, -30);
//! ```
//!
//! ## Thread Safety
//!
//! The engine holds no shared mutable state. Concurrent transfers touching
//! the same account are serialized by row locks acquired in account id
//! order, so transfers in opposite directions cannot deadlock.

pub mod account;
mod base;
mod context;
pub mod engine;
pub mod entry;
pub mod error;
pub mod logging;
pub mod service;
pub mod store;
pub mod transfer;

pub use account::{Account, CreateAccountParams, ListAccountsParams};
pub use base::{AccountId, Currency, EntryId, TransferId, UnsupportedCurrency};
pub use context::Context;
pub use engine::Engine;
pub use entry::{Entry, ListEntriesParams};
pub use error::{ErrorClass, StoreError, TransferError};
pub use service::{BankService, ServiceError};
pub use store::{FaultPoint, MemoryStore, Queries, Store, StoreConfig};
pub use transfer::{AccountRole, ListTransfersParams, Transfer, TransferParams, TransferResult};
