// Copyright [2026] [Privgate Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{MediationError, MediationResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_WINDOW_SECS: u64 = 86_400;

/// Per-source privacy-loss account. `consumed` is private: the only
/// mutation path is `BudgetLedger::reserve` under the ledger lock, so
/// `consumed <= allowance` cannot be violated by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAccount {
    allowance: f64,
    consumed: f64,
    window_start: u64,
}

impl BudgetAccount {
    fn new(allowance: f64, now: u64) -> Self {
        Self {
            allowance,
            consumed: 0.0,
            window_start: now,
        }
    }

    pub fn allowance(&self) -> f64 {
        self.allowance
    }

    pub fn consumed(&self) -> f64 {
        self.consumed
    }

    pub fn remaining(&self) -> f64 {
        (self.allowance - self.consumed).max(0.0)
    }

    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    fn roll_window(&mut self, now: u64, window_secs: u64) -> bool {
        if now >= self.window_start.saturating_add(window_secs) {
            self.consumed = 0.0;
            self.window_start = now;
            true
        } else {
            false
        }
    }
}

/// Proof of a granted reservation, carrying the amount for audit purposes.
#[derive(Debug, Clone, PartialEq)]
pub struct Reserved {
    pub data_source_id: String,
    pub epsilon: f64,
    pub remaining: f64,
    pub allowance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub allowance: f64,
    pub consumed: f64,
    pub remaining: f64,
}

/// Tracks cumulative privacy loss per data source against a bounded
/// recurring allowance under additive sequential composition.
///
/// `reserve` is the single safety-critical operation: check and debit
/// happen in one critical section, never as a separate check followed by a
/// separate consume, so concurrent callers cannot overspend the allowance.
#[derive(Debug)]
pub struct BudgetLedger {
    accounts: Mutex<HashMap<String, BudgetAccount>>,
    default_allowance: f64,
    window_secs: u64,
}

impl BudgetLedger {
    pub fn new(default_allowance: f64, window_secs: u64) -> MediationResult<Self> {
        if !default_allowance.is_finite() || default_allowance <= 0.0 {
            return Err(MediationError::Configuration(
                "default allowance must be finite and > 0".to_string(),
            ));
        }
        if window_secs == 0 {
            return Err(MediationError::Configuration(
                "allowance window must be > 0 seconds".to_string(),
            ));
        }
        Ok(Self {
            accounts: Mutex::new(HashMap::new()),
            default_allowance,
            window_secs,
        })
    }

    /// Atomically check and debit `epsilon` against the source's allowance.
    ///
    /// On success the account is debited and a `Reserved` token is
    /// returned; on `InsufficientBudget` the account is untouched and the
    /// caller may retry with a smaller epsilon or after the window resets.
    /// Accounts are created lazily on first reservation.
    pub fn reserve(
        &self,
        data_source_id: &str,
        epsilon: f64,
        now: u64,
    ) -> MediationResult<Reserved> {
        if data_source_id.is_empty() {
            return Err(MediationError::InvalidArgument(
                "data_source_id must be non-empty".to_string(),
            ));
        }
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(MediationError::InvalidArgument(
                "epsilon must be finite and > 0".to_string(),
            ));
        }

        let mut accounts = self.accounts.lock();
        let account = accounts
            .entry(data_source_id.to_string())
            .or_insert_with(|| BudgetAccount::new(self.default_allowance, now));
        account.roll_window(now, self.window_secs);

        let next = account.consumed + epsilon;
        if !next.is_finite() || next > account.allowance + f64::EPSILON {
            return Err(MediationError::InsufficientBudget {
                requested: epsilon,
                remaining: account.remaining(),
            });
        }
        account.consumed = next;
        Ok(Reserved {
            data_source_id: data_source_id.to_string(),
            epsilon,
            remaining: account.remaining(),
            allowance: account.allowance,
        })
    }

    /// Current budget view for a source. Unknown sources report a full,
    /// untouched default allowance; no account is created.
    pub fn status(&self, data_source_id: &str) -> BudgetStatus {
        let accounts = self.accounts.lock();
        match accounts.get(data_source_id) {
            Some(account) => BudgetStatus {
                allowance: account.allowance,
                consumed: account.consumed,
                remaining: account.remaining(),
            },
            None => BudgetStatus {
                allowance: self.default_allowance,
                consumed: 0.0,
                remaining: self.default_allowance,
            },
        }
    }

    /// Override the allowance for one source. The account keeps whatever it
    /// has already consumed this window; shrinking the allowance below the
    /// consumed amount is rejected so the ledger invariant stays intact.
    pub fn set_allowance(
        &self,
        data_source_id: &str,
        allowance: f64,
        now: u64,
    ) -> MediationResult<()> {
        if !allowance.is_finite() || allowance <= 0.0 {
            return Err(MediationError::InvalidArgument(
                "allowance must be finite and > 0".to_string(),
            ));
        }
        let mut accounts = self.accounts.lock();
        let account = accounts
            .entry(data_source_id.to_string())
            .or_insert_with(|| BudgetAccount::new(allowance, now));
        if account.consumed > allowance + f64::EPSILON {
            return Err(MediationError::InvalidArgument(
                "allowance below amount already consumed this window".to_string(),
            ));
        }
        account.allowance = allowance;
        Ok(())
    }

    /// Background sweep: zero `consumed` and advance `window_start` for
    /// every account whose window elapsed. Runs under the ledger lock, so a
    /// reservation in flight settles against the state it was validated
    /// under and is never retroactively invalidated.
    pub fn reset_expired(&self, now: u64) -> usize {
        let mut accounts = self.accounts.lock();
        accounts
            .values_mut()
            .map(|account| account.roll_window(now, self.window_secs))
            .filter(|&rolled| rolled)
            .count()
    }

    /// Snapshot of all accounts for durable persistence.
    pub fn export(&self) -> HashMap<String, BudgetAccount> {
        self.accounts.lock().clone()
    }

    /// Restore a persisted snapshot, failing closed on any account whose
    /// numbers would make the ledger invariant unverifiable.
    pub fn restore(&self, snapshot: HashMap<String, BudgetAccount>) -> MediationResult<()> {
        for (source, account) in &snapshot {
            let valid = account.allowance.is_finite()
                && account.allowance > 0.0
                && account.consumed.is_finite()
                && account.consumed >= 0.0
                && account.consumed <= account.allowance + f64::EPSILON;
            if !valid {
                return Err(MediationError::Configuration(format!(
                    "persisted budget account {source:?} violates consumed <= allowance"
                )));
            }
        }
        *self.accounts.lock() = snapshot;
        Ok(())
    }
}
