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

//! Concurrency tests for the transfer engine.
//!
//! Row locks are always requested in account id order, so transfers running
//! in opposite directions or around a cycle of accounts must all finish. A
//! lock-order bug would surface here as `LockTimeout` errors or a stalled
//! watchdog. parking_lot's deadlock detector additionally watches the
//! store's internal mutexes.

use bank_ledger_rs::{
    AccountId, Context, CreateAccountParams, Currency, Engine, MemoryStore, Store, StoreConfig,
    TransferError, TransferParams,
};
use parking_lot::deadlock;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

const WATCHDOG: Duration = Duration::from_secs(60);

// === Helpers ===

fn setup() -> (Arc<MemoryStore>, Engine<MemoryStore>) {
    // Generous lock timeout: only a real lock cycle would exhaust it.
    let store = Arc::new(MemoryStore::with_config(StoreConfig {
        lock_timeout: Duration::from_secs(30),
        ..StoreConfig::default()
    }));
    let engine = Engine::new(Arc::clone(&store));
    (store, engine)
}

fn open(store: &MemoryStore, balance: i64) -> AccountId {
    store
        .create_account(
            &Context::background(),
            CreateAccountParams::new("owner", Currency::USD).with_balance(balance),
        )
        .unwrap()
        .id
}

fn balance(store: &MemoryStore, id: AccountId) -> i64 {
    store
        .get_account(&Context::background(), id)
        .unwrap()
        .balance
}

fn make_transfer(from: AccountId, to: AccountId, amount: i64) -> TransferParams {
    TransferParams {
        from_account_id: from,
        to_account_id: to,
        amount,
        currency: Currency::USD,
    }
}

/// Runs `f` on its own thread and fails the test if it does not finish in time.
fn with_watchdog<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        f();
        let _ = done_tx.send(());
    });

    match done_rx.recv_timeout(WATCHDOG) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if let Err(payload) = handle.join() {
                panic::resume_unwind(payload);
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            panic!("transfers still running after {WATCHDOG:?}; lock cycle suspected")
        }
    }
}

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("Deadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}\n{:#?}", t.thread_id(), t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
}

// === Tests ===

/// N concurrent A→B transfers lose no update.
#[test]
fn concurrent_transfers_lose_no_updates() {
    const NUM_THREADS: usize = 20;
    const TRANSFERS_PER_THREAD: usize = 25;
    const AMOUNT: i64 = 10;
    const INITIAL: i64 = 1_000_000;

    let (store, engine) = setup();
    let a = open(&store, INITIAL);
    let b = open(&store, INITIAL);

    with_watchdog(move || {
        thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                let engine = engine.clone();
                s.spawn(move || {
                    let ctx = Context::background();
                    for _ in 0..TRANSFERS_PER_THREAD {
                        engine.transfer(&ctx, make_transfer(a, b, AMOUNT)).unwrap();
                    }
                });
            }
        });
    });

    let n = (NUM_THREADS * TRANSFERS_PER_THREAD) as i64;
    assert_eq!(balance(&store, a), INITIAL - n * AMOUNT);
    assert_eq!(balance(&store, b), INITIAL + n * AMOUNT);
    assert_eq!(store.transfer_count(), n as usize);
    assert_eq!(store.entry_count(), 2 * n as usize);
}

/// Transfers A→B and B→A running at the same time never block each other forever.
#[test]
fn opposing_transfers_do_not_deadlock() {
    const NUM_THREADS: usize = 16;
    const TRANSFERS_PER_THREAD: usize = 50;
    const INITIAL: i64 = 100_000;

    let detector = start_deadlock_detector();
    let (store, engine) = setup();
    let a = open(&store, INITIAL);
    let b = open(&store, INITIAL);

    with_watchdog(move || {
        thread::scope(|s| {
            for thread_id in 0..NUM_THREADS {
                let engine = engine.clone();
                s.spawn(move || {
                    let ctx = Context::background();
                    let (from, to) = if thread_id % 2 == 0 { (a, b) } else { (b, a) };
                    for _ in 0..TRANSFERS_PER_THREAD {
                        engine.transfer(&ctx, make_transfer(from, to, 7)).unwrap();
                    }
                });
            }
        });
    });

    stop_deadlock_detector(detector);

    // Equal numbers of threads run in each direction.
    assert_eq!(balance(&store, a), INITIAL);
    assert_eq!(balance(&store, b), INITIAL);
    assert_eq!(store.transfer_count(), NUM_THREADS * TRANSFERS_PER_THREAD);
}

/// Transfers around a cycle of accounts (0→1→2→...→0) complete.
#[test]
fn transfers_around_a_cycle_do_not_deadlock() {
    const NUM_ACCOUNTS: usize = 6;
    const ROUNDS: usize = 100;
    const INITIAL: i64 = 10_000;

    let detector = start_deadlock_detector();
    let (store, engine) = setup();
    let ids: Vec<AccountId> = (0..NUM_ACCOUNTS).map(|_| open(&store, INITIAL)).collect();
    let ring = ids.clone();

    with_watchdog(move || {
        thread::scope(|s| {
            for i in 0..NUM_ACCOUNTS {
                let engine = engine.clone();
                let from = ring[i];
                let to = ring[(i + 1) % NUM_ACCOUNTS];
                s.spawn(move || {
                    let ctx = Context::background();
                    for _ in 0..ROUNDS {
                        engine.transfer(&ctx, make_transfer(from, to, 3)).unwrap();
                    }
                });
            }
        });
    });

    stop_deadlock_detector(detector);

    for id in ids {
        assert_eq!(balance(&store, id), INITIAL);
    }
}

/// Many threads draining one account: exactly as many succeed as funds allow.
#[test]
fn concurrent_overdraft_attempts_never_go_negative() {
    const NUM_THREADS: usize = 40;

    let (store, engine) = setup();
    let a = open(&store, 100);
    let b = open(&store, 0);
    let succeeded = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    {
        let succeeded = Arc::clone(&succeeded);
        let rejected = Arc::clone(&rejected);
        with_watchdog(move || {
            thread::scope(|s| {
                for _ in 0..NUM_THREADS {
                    let engine = engine.clone();
                    let succeeded = Arc::clone(&succeeded);
                    let rejected = Arc::clone(&rejected);
                    s.spawn(move || {
                        match engine.transfer(&Context::background(), make_transfer(a, b, 10)) {
                            Ok(_) => succeeded.fetch_add(1, Ordering::SeqCst),
                            Err(TransferError::InsufficientFunds { .. }) => {
                                rejected.fetch_add(1, Ordering::SeqCst)
                            }
                            Err(other) => panic!("unexpected error: {other}"),
                        };
                    });
                }
            });
        });
    }

    assert_eq!(succeeded.load(Ordering::SeqCst), 10);
    assert_eq!(rejected.load(Ordering::SeqCst), NUM_THREADS - 10);
    assert_eq!(balance(&store, a), 0);
    assert_eq!(balance(&store, b), 100);
    assert_eq!(store.transfer_count(), 10);
}

/// A held lock on one pair of accounts does not stall a disjoint pair.
#[test]
fn disjoint_transfers_are_not_blocked() {
    let (store, engine) = setup();
    let a = open(&store, 100);
    let b = open(&store, 100);
    let c = open(&store, 100);
    let d = open(&store, 100);
    let ctx = Context::background();

    store
        .execute_in_transaction(&ctx, |q| -> Result<(), TransferError> {
            q.get_account_for_update(a)?;
            q.get_account_for_update(b)?;

            let bounded = Context::with_timeout(Duration::from_secs(5));
            let result = thread::scope(|s| {
                s.spawn(|| engine.transfer(&bounded, make_transfer(c, d, 25)))
                    .join()
                    .unwrap()
            });
            assert!(result.is_ok());
            Ok(())
        })
        .unwrap();

    assert_eq!(balance(&store, c), 75);
    assert_eq!(balance(&store, d), 125);
}

/// A transfer stuck behind a held lock is cancelled when its deadline passes
/// and leaves nothing behind.
#[test]
fn transfer_waiting_on_lock_is_cancelled_by_deadline() {
    let (store, engine) = setup();
    let a = open(&store, 100);
    let b = open(&store, 100);
    let ctx = Context::background();

    store
        .execute_in_transaction(&ctx, |q| -> Result<(), TransferError> {
            q.get_account_for_update(b)?;

            let bounded = Context::with_timeout(Duration::from_millis(50));
            let result = thread::scope(|s| {
                s.spawn(|| engine.transfer(&bounded, make_transfer(a, b, 25)))
                    .join()
                    .unwrap()
            });
            assert_eq!(result, Err(TransferError::Cancelled));
            Ok(())
        })
        .unwrap();

    assert_eq!(balance(&store, a), 100);
    assert_eq!(balance(&store, b), 100);
    assert_eq!(store.entry_count(), 0);
    assert_eq!(store.transfer_count(), 0);
}

/// Cancelling the parent context aborts a transfer waiting on a row lock.
#[test]
fn transfer_waiting_on_lock_is_cancelled_by_parent() {
    let (store, engine) = setup();
    let a = open(&store, 100);
    let b = open(&store, 100);
    let ctx = Context::background();
    let request_ctx = Context::background();

    store
        .execute_in_transaction(&ctx, |q| -> Result<(), TransferError> {
            q.get_account_for_update(a)?;

            let result = thread::scope(|s| {
                let child = request_ctx.child();
                let handle = s.spawn(move || engine.transfer(&child, make_transfer(b, a, 25)));
                thread::sleep(Duration::from_millis(30));
                request_ctx.cancel();
                handle.join().unwrap()
            });
            assert_eq!(result, Err(TransferError::Cancelled));
            Ok(())
        })
        .unwrap();

    assert_eq!(balance(&store, a), 100);
    assert_eq!(balance(&store, b), 100);
    assert_eq!(store.transfer_count(), 0);
}
