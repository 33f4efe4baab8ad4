// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

use privgate_core::budget::{BudgetLedger, DEFAULT_WINDOW_SECS};
use privgate_core::MediationError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Launching N concurrent reservations where N * epsilon exceeds the
/// allowance must grant exactly floor(allowance / epsilon) of them,
/// regardless of scheduling.
#[test]
fn concurrent_reservations_never_overspend() {
    let allowance = 10.0;
    let epsilon = 1.5;
    let threads = 32;
    let expected_winners = 6; // floor(10.0 / 1.5)

    let ledger = Arc::new(BudgetLedger::new(allowance, DEFAULT_WINDOW_SECS).expect("ledger"));
    let successes = Arc::new(AtomicUsize::new(0));
    let rejections = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let ledger = Arc::clone(&ledger);
        let successes = Arc::clone(&successes);
        let rejections = Arc::clone(&rejections);
        handles.push(thread::spawn(move || {
            match ledger.reserve("shared-source", epsilon, 0) {
                Ok(_) => {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
                Err(MediationError::InsufficientBudget { .. }) => {
                    rejections.fetch_add(1, Ordering::SeqCst);
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }));
    }
    for handle in handles {
        handle.join().expect("thread join");
    }

    assert_eq!(successes.load(Ordering::SeqCst), expected_winners);
    assert_eq!(rejections.load(Ordering::SeqCst), threads - expected_winners);

    let status = ledger.status("shared-source");
    assert!((status.consumed - expected_winners as f64 * epsilon).abs() < 1e-9);
    assert!(status.consumed <= allowance + 1e-9);
}

/// Exact exhaustion: an allowance that divides evenly grants every slice
/// and nothing more.
#[test]
fn concurrent_reservations_reach_exact_exhaustion() {
    let ledger = Arc::new(BudgetLedger::new(10.0, DEFAULT_WINDOW_SECS).expect("ledger"));
    let successes = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = Arc::clone(&ledger);
        let successes = Arc::clone(&successes);
        handles.push(thread::spawn(move || {
            for _ in 0..4 {
                if ledger.reserve("src", 2.5, 0).is_ok() {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("thread join");
    }

    assert_eq!(successes.load(Ordering::SeqCst), 4); // floor(10.0 / 2.5)
    let status = ledger.status("src");
    assert!(status.remaining.abs() < 1e-9);
}

/// Reservations against distinct sources do not contend for budget.
#[test]
fn concurrent_reservations_on_distinct_sources_are_independent() {
    let ledger = Arc::new(BudgetLedger::new(1.0, DEFAULT_WINDOW_SECS).expect("ledger"));

    let mut handles = Vec::new();
    for worker in 0..8 {
        let ledger = Arc::clone(&ledger);
        handles.push(thread::spawn(move || {
            let source = format!("src-{worker}");
            for _ in 0..10 {
                ledger.reserve(&source, 0.1, 0).expect("within allowance");
            }
            assert!(ledger.reserve(&source, 0.1, 0).is_err());
        }));
    }
    for handle in handles {
        handle.join().expect("thread join");
    }
}
