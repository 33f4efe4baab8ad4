// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{MediationError, MediationResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// One year, in seconds.
pub const DEFAULT_RETENTION_SECS: u64 = 31_536_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Reserve,
    NoiseQuery,
    EncryptDataset,
    Compute,
    Decrypt,
    Anonymize,
    BudgetReset,
    KeyRotation,
    DatasetPurge,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::Reserve => "reserve",
            OperationKind::NoiseQuery => "noise_query",
            OperationKind::EncryptDataset => "encrypt_dataset",
            OperationKind::Compute => "compute",
            OperationKind::Decrypt => "decrypt",
            OperationKind::Anonymize => "anonymize",
            OperationKind::BudgetReset => "budget_reset",
            OperationKind::KeyRotation => "key_rotation",
            OperationKind::DatasetPurge => "dataset_purge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: u64,
    pub kind: OperationKind,
    /// Data source or dataset the operation acted on.
    pub subject: String,
    /// Parameter summary; never raw record contents or key material.
    pub summary: Value,
    pub timestamp: u64,
}

/// Durable sink an `AuditLog` writes through before acknowledging an
/// append. A sink failure fails the triggering operation closed.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub kind: Option<OperationKind>,
    pub subject: Option<String>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
struct AuditState {
    next_id: u64,
    records: VecDeque<AuditRecord>,
}

/// Append-only, time-bounded record of every privacy-relevant operation.
/// There is no update and no delete-by-id; the only removal path is the
/// retention-window prune.
pub struct AuditLog {
    retention_secs: u64,
    sink: Option<Arc<dyn AuditSink>>,
    state: Mutex<AuditState>,
}

impl AuditLog {
    pub fn new(retention_secs: u64) -> Self {
        Self {
            retention_secs: if retention_secs == 0 {
                DEFAULT_RETENTION_SECS
            } else {
                retention_secs
            },
            sink: None,
            state: Mutex::new(AuditState::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Append a record, writing through the durable sink first. On sink
    /// failure the record is not retained and the caller must treat its
    /// own operation as failed; an un-audited privacy operation must never
    /// be reported as successful.
    pub fn append(
        &self,
        kind: OperationKind,
        subject: &str,
        summary: Value,
        now: u64,
    ) -> MediationResult<u64> {
        let mut state = self.state.lock();
        let record = AuditRecord {
            id: state.next_id,
            kind,
            subject: subject.to_string(),
            summary,
            timestamp: now,
        };
        if let Some(sink) = &self.sink {
            sink.append(&record)
                .map_err(|err| MediationError::AuditWriteFailure(err.to_string()))?;
        }
        state.next_id += 1;
        let id = record.id;
        state.records.push_back(record);
        Ok(id)
    }

    /// Remove records older than the retention window. Records are
    /// appended in timestamp order, so pruning pops from the front.
    pub fn prune(&self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.retention_secs);
        let mut state = self.state.lock();
        let mut pruned = 0usize;
        while state
            .records
            .front()
            .is_some_and(|record| record.timestamp < cutoff)
        {
            state.records.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Filtered view for compliance tooling, newest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        let state = self.state.lock();
        let matches = state.records.iter().rev().filter(|record| {
            filter.kind.is_none_or(|kind| record.kind == kind)
                && filter
                    .subject
                    .as_deref()
                    .is_none_or(|subject| record.subject == subject)
                && filter.since.is_none_or(|since| record.timestamp >= since)
        });
        match filter.limit {
            Some(limit) => matches.take(limit).cloned().collect(),
            None => matches.cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }
}
