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

//! Error types for storage and transfer processing.

use crate::base::{AccountId, Currency};
use crate::transfer::AccountRole;
use thiserror::Error;

/// Coarse classification used by callers to map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Caller-supplied bad input. Never retried.
    Validation,
    /// Well-formed request rejected by a business rule. Never retried.
    BusinessRule,
    /// A referenced record does not exist.
    NotFound,
    /// Storage fault, lock timeout or cancellation. May be retried.
    Transient,
}

/// Storage layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{table} {id} not found")]
    NotFound { table: &'static str, id: i64 },

    /// Insert references a row that does not exist.
    #[error("{table} references missing account {id}")]
    ForeignKeyViolation { table: &'static str, id: i64 },

    /// Write would break a column constraint, such as a negative balance.
    #[error("{table}.{column} check constraint violated by {value}")]
    CheckViolation {
        table: &'static str,
        column: &'static str,
        value: i64,
    },

    /// Waited longer than the configured lock timeout for a row lock.
    #[error("timed out waiting for row lock on account {account_id}")]
    LockTimeout { account_id: AccountId },

    #[error("unit of work cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StoreError::Cancelled | StoreError::DeadlineExceeded)
    }
}

/// Errors surfaced by [`Engine::transfer`](crate::Engine::transfer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    #[error("cannot transfer to the same account")]
    SameAccount,

    #[error("{which} account {account_id} not found")]
    AccountNotFound {
        which: AccountRole,
        account_id: AccountId,
    },

    #[error("{which} account {account_id} currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch {
        which: AccountRole,
        account_id: AccountId,
        expected: Currency,
        actual: Currency,
    },

    #[error("account {account_id} has insufficient balance: {balance} < {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: i64,
        requested: i64,
    },

    /// Applying the transfer would overflow the account balance
    #[error("balance overflow on account {account_id}")]
    BalanceOverflow { account_id: AccountId },

    #[error("storage failure: {0}")]
    Storage(StoreError),

    /// Context cancelled or deadline exceeded; nothing was written.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::InvalidAmount
            | TransferError::SameAccount
            | TransferError::CurrencyMismatch { .. } => ErrorClass::Validation,
            TransferError::InsufficientFunds { .. } | TransferError::BalanceOverflow { .. } => {
                ErrorClass::BusinessRule
            }
            TransferError::AccountNotFound { .. } => ErrorClass::NotFound,
            TransferError::Storage(_) | TransferError::Cancelled => ErrorClass::Transient,
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        if err.is_cancellation() {
            TransferError::Cancelled
        } else {
            TransferError::Storage(err)
        }
    }
}
