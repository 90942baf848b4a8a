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

//! Transfer records and the engine's input/output types.

use crate::account::Account;
use crate::base::{AccountId, Currency, TransferId};
use crate::entry::Entry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable record of one completed movement of funds.
///
/// A transfer row exists if and only if both of its entries and both
/// balance updates were committed in the same unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Strictly positive amount in minor units.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Input to [`Engine::transfer`](crate::Engine::transfer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    /// Currency both accounts are expected to hold.
    pub currency: Currency,
}

/// Everything a committed transfer produced.
///
/// Assembled per call and never persisted as its own entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Side of a transfer an account plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    From,
    To,
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRole::From => f.write_str("from"),
            AccountRole::To => f.write_str("to"),
        }
    }
}

/// Page of transfers touching one account on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTransfersParams {
    pub account_id: AccountId,
    pub limit: usize,
    pub offset: usize,
}
