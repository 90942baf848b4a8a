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

//! Request façade.
//!
//! [`BankService`] sits between a transport layer and the ledger. It
//! validates inbound fields and checks that the authenticated owner may act
//! on the accounts involved. It then delegates to the store or the transfer
//! engine. Caller identity is passed in already authenticated.

use crate::account::{Account, CreateAccountParams, ListAccountsParams};
use crate::base::{AccountId, Currency};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{ErrorClass, StoreError, TransferError};
use crate::store::Store;
use crate::transfer::{TransferParams, TransferResult};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Smallest and largest page sizes accepted by [`BankService::list_accounts`].
pub const PAGE_SIZE_RANGE: std::ops::RangeInclusive<usize> = 5..=10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateAccountRequest {
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListAccountsRequest {
    pub page_id: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub currency: Currency,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Caller does not own the account
    #[error("account {account_id} doesn't belong to the authenticated user")]
    Unauthorized { account_id: AccountId },

    #[error("account {account_id} not found")]
    NotFound { account_id: AccountId },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Storage(StoreError),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::InvalidRequest(_) | ServiceError::Unauthorized { .. } => {
                ErrorClass::Validation
            }
            ServiceError::NotFound { .. } => ErrorClass::NotFound,
            ServiceError::Transfer(err) => err.class(),
            ServiceError::Storage(_) => ErrorClass::Transient,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        if err.is_cancellation() {
            ServiceError::Transfer(TransferError::Cancelled)
        } else {
            ServiceError::Storage(err)
        }
    }
}

/// Account and transfer operations on behalf of an authenticated owner.
pub struct BankService<S> {
    store: Arc<S>,
    engine: Engine<S>,
}

impl<S: Store> BankService<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            engine,
        }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    /// Opens an empty account for `owner`.
    pub fn create_account(
        &self,
        ctx: &Context,
        owner: &str,
        request: CreateAccountRequest,
    ) -> Result<Account, ServiceError> {
        if owner.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("owner is required".into()));
        }
        let account = self
            .store
            .create_account(ctx, CreateAccountParams::new(owner, request.currency))?;
        debug!(account = %account.id, owner, currency = %account.currency, "account opened");
        Ok(account)
    }

    pub fn get_account(
        &self,
        ctx: &Context,
        owner: &str,
        account_id: AccountId,
    ) -> Result<Account, ServiceError> {
        self.owned_account(ctx, owner, account_id)
    }

    /// One page of the caller's own accounts.
    pub fn list_accounts(
        &self,
        ctx: &Context,
        owner: &str,
        request: ListAccountsRequest,
    ) -> Result<Vec<Account>, ServiceError> {
        if request.page_id < 1 {
            return Err(ServiceError::InvalidRequest("page_id must be at least 1".into()));
        }
        if !PAGE_SIZE_RANGE.contains(&request.page_size) {
            return Err(ServiceError::InvalidRequest(format!(
                "page_size must be between {} and {}",
                PAGE_SIZE_RANGE.start(),
                PAGE_SIZE_RANGE.end()
            )));
        }
        let offset = (request.page_id - 1)
            .checked_mul(request.page_size)
            .ok_or_else(|| ServiceError::InvalidRequest("page_id is too large".into()))?;
        let params = ListAccountsParams {
            owner: Some(owner.to_string()),
            limit: request.page_size,
            offset,
        };
        Ok(self.store.list_accounts(ctx, &params)?)
    }

    /// Transfers money out of one of the caller's accounts.
    pub fn create_transfer(
        &self,
        ctx: &Context,
        owner: &str,
        request: TransferRequest,
    ) -> Result<TransferResult, ServiceError> {
        for (field, id) in [
            ("from_account_id", request.from_account_id),
            ("to_account_id", request.to_account_id),
        ] {
            if id < 1 {
                return Err(ServiceError::InvalidRequest(format!("{field} must be at least 1")));
            }
        }
        if request.amount <= 0 {
            return Err(TransferError::InvalidAmount.into());
        }

        let from_account_id = AccountId(request.from_account_id);
        match self.store.get_account(ctx, from_account_id) {
            Ok(account) if account.owner != owner => {
                return Err(ServiceError::Unauthorized {
                    account_id: from_account_id,
                });
            }
            Ok(_) => {}
            // Let the engine report which side is missing.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let params = TransferParams {
            from_account_id,
            to_account_id: AccountId(request.to_account_id),
            amount: request.amount,
            currency: request.currency,
        };
        Ok(self.engine.transfer(ctx, params)?)
    }

    fn owned_account(
        &self,
        ctx: &Context,
        owner: &str,
        account_id: AccountId,
    ) -> Result<Account, ServiceError> {
        let account = self
            .store
            .get_account(ctx, account_id)
            .map_err(|err| match err {
                StoreError::NotFound { .. } => ServiceError::NotFound { account_id },
                other => other.into(),
            })?;
        if account.owner != owner {
            return Err(ServiceError::Unauthorized { account_id });
        }
        Ok(account)
    }
}
