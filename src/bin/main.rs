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

use bank_ledger_rs::service::TransferRequest;
use bank_ledger_rs::{
    BankService, Context, CreateAccountParams, Currency, Engine, ListAccountsParams,
    MemoryStore, Store, StoreConfig, logging,
};
use clap::Parser;
use csv::{Reader, ReaderBuilder, StringRecord, Trim, Writer};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bank Ledger - Replay a ledger script
///
/// Reads account openings and transfers from a CSV file, runs them through
/// the transfer engine and prints the final account balances to stdout.
#[derive(Parser, Debug)]
#[command(name = "bank-ledger")]
#[command(about = "Replays a CSV ledger script through the transfer engine", long_about = None)]
struct Args {
    /// Path to CSV file with ledger operations
    ///
    /// Expected format: type,owner,currency,from,to,amount
    /// Example: cargo run -- script.csv > accounts.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Longest time a transfer waits for an account row lock
    #[arg(long, default_value_t = 5_000)]
    lock_timeout_ms: u64,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn main() {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %args.input.display(), error = %e, "cannot open input");
            process::exit(1);
        }
    };

    let config = StoreConfig {
        lock_timeout: Duration::from_millis(args.lock_timeout_ms),
        ..StoreConfig::default()
    };
    let service = BankService::new(Engine::new(Arc::new(MemoryStore::with_config(config))));

    if let Err(e) = replay(&service, BufReader::new(file)) {
        error!(error = %e, "cannot read ledger script");
        process::exit(1);
    }

    if let Err(e) = write_accounts(&service, std::io::stdout()) {
        error!(error = %e, "cannot write accounts");
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `type, owner, currency, from, to, amount`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    op: String,
    owner: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    currency: Option<Currency>,
    #[serde(deserialize_with = "csv::invalid_option")]
    from: Option<i64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    to: Option<i64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    amount: Option<i64>,
}

/// Account row written to stdout.
#[derive(Debug, Serialize)]
struct AccountRecord<'a> {
    id: i64,
    owner: &'a str,
    balance: i64,
    currency: Currency,
}

fn script_reader<R: Read>(reader: R) -> Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader)
}

/// 1-based line of `record` in the input file, header included.
fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, |pos| pos.line())
}

/// Applies every row of a ledger script.
///
/// # CSV Format
///
/// ```csv
/// type,owner,currency,from,to,amount
/// open,alice,USD,,,100
/// open,bob,USD,,,
/// transfer,alice,USD,1,2,30
/// ```
///
/// `open` rows create an account, seeded with `amount` when present.
/// `transfer` rows move money on behalf of `owner`. Malformed rows and
/// rejected transfers are logged and skipped.
fn replay<S: Store, R: Read>(service: &BankService<S>, reader: R) -> Result<(), csv::Error> {
    let ctx = Context::background();
    let mut rdr = script_reader(reader);
    let headers = rdr.headers()?.clone();

    for result in rdr.records() {
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                let line = e.position().map_or(0, |pos| pos.line());
                warn!(line, error = %e, "skipping unreadable row");
                continue;
            }
        };
        let line = line_of(&raw);
        let record: CsvRecord = match raw.deserialize(Some(&headers)) {
            Ok(record) => record,
            Err(e) => {
                warn!(line, error = %e, "skipping malformed row");
                continue;
            }
        };

        match (record.op.to_lowercase().as_str(), record.currency) {
            ("open", Some(currency)) => {
                let params = CreateAccountParams::new(record.owner.as_str(), currency)
                    .with_balance(record.amount.unwrap_or(0));
                match service.engine().store().create_account(&ctx, params) {
                    Ok(account) => info!(account = %account.id, "opened account"),
                    Err(e) => warn!(line, error = %e, "open failed"),
                }
            }
            ("transfer", Some(currency)) => {
                let (Some(from), Some(to), Some(amount)) = (record.from, record.to, record.amount)
                else {
                    warn!(line, "skipping incomplete transfer row");
                    continue;
                };
                let request = TransferRequest {
                    from_account_id: from,
                    to_account_id: to,
                    amount,
                    currency,
                };
                if let Err(e) = service.create_transfer(&ctx, &record.owner, request) {
                    warn!(line, error = %e, "transfer rejected");
                }
            }
            (op, _) => warn!(line, op, "skipping invalid row"),
        }
    }

    Ok(())
}

/// Writes every account as `id,owner,balance,currency`, ordered by id.
fn write_accounts<S: Store, W: Write>(
    service: &BankService<S>,
    writer: W,
) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = service.engine().store().list_accounts(
        &Context::background(),
        &ListAccountsParams {
            owner: None,
            limit: usize::MAX,
            offset: 0,
        },
    )?;

    let mut wtr = Writer::from_writer(writer);
    for account in &accounts {
        wtr.serialize(AccountRecord {
            id: account.id.0,
            owner: &account.owner,
            balance: account.balance,
            currency: account.currency,
        })?;
    }
    wtr.flush()?;
    Ok(())
}
