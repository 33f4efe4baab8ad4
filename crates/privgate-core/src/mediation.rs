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

use crate::anonymize::{self, AnonRecord, AnonymizationOutcome};
use crate::audit::{AuditFilter, AuditLog, AuditRecord, OperationKind};
use crate::budget::{BudgetLedger, BudgetStatus};
use crate::error::{MediationError, MediationResult};
use crate::gateway::{ComputeOp, DecryptCapability, SecureGateway};
use crate::noise;
use crate::policy::{PolicyRegistry, Technique};
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A reservation leaving less than this fraction of the allowance emits a
/// `budget_low` event.
pub const BUDGET_LOW_FRACTION: f64 = 0.1;

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Outbound notifications for collaborators. Implementations must not
/// block; the engine calls these inline on the request path.
pub trait EventSink: Send + Sync {
    fn budget_low(&self, _data_source_id: &str, _remaining: f64, _allowance: f64) {}
    fn policy_violation(&self, _kind: &str, _details: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {}

#[derive(Debug, Clone, PartialEq)]
pub struct NoisedResult {
    pub noised_values: Vec<f64>,
    pub epsilon_spent: f64,
    pub remaining_budget: f64,
}

/// Single entry point for external callers. Every request flows policy
/// lookup → budget check/reserve → mechanism execution → audit append, in
/// that order; a request never proceeds past a failed budget check, and a
/// privileged operation that cannot be audited fails closed.
pub struct MediationEngine {
    registry: Arc<PolicyRegistry>,
    ledger: Arc<BudgetLedger>,
    gateway: Arc<SecureGateway>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl MediationEngine {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        ledger: Arc<BudgetLedger>,
        gateway: Arc<SecureGateway>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            registry,
            ledger,
            gateway,
            audit,
            clock: Arc::new(SystemClock),
            events: Arc::new(NullEventSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &SecureGateway {
        &self.gateway
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Differential-privacy query over a numeric result vector.
    ///
    /// Calibration parameters are validated before any reservation so an
    /// invalid query never spends budget. Once the reservation succeeds it
    /// is not refunded, even if the mechanism fails afterwards: a sampled
    /// query is privacy risk already taken, not a refundable credit.
    pub fn mediate_query(
        &self,
        data_source_id: &str,
        data_category: &str,
        epsilon: f64,
        sensitivity: f64,
        values: &[f64],
    ) -> MediationResult<NoisedResult> {
        noise::laplace_scale(sensitivity, epsilon)?;
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(MediationError::InvalidArgument(format!(
                "query values must be finite, got {bad}"
            )));
        }
        let now = self.clock.now_unix();

        let policy = self.registry.lookup(data_category)?;
        if !policy.requires(Technique::Noise) {
            let err = MediationError::PolicyMismatch {
                data_category: data_category.to_string(),
                technique: Technique::Noise.as_str(),
            };
            self.events
                .policy_violation("technique_not_permitted", &err.to_string());
            return Err(self.audit_rejection(
                OperationKind::NoiseQuery,
                data_source_id,
                json!({"data_category": data_category, "error": err.to_string()}),
                now,
                err,
            ));
        }

        let reserved = match self.ledger.reserve(data_source_id, epsilon, now) {
            Ok(reserved) => reserved,
            Err(err) => {
                return Err(self.audit_rejection(
                    OperationKind::Reserve,
                    data_source_id,
                    json!({
                        "data_category": data_category,
                        "epsilon": epsilon,
                        "error": err.to_string(),
                    }),
                    now,
                    err,
                ));
            }
        };
        if reserved.remaining < BUDGET_LOW_FRACTION * reserved.allowance {
            self.events
                .budget_low(data_source_id, reserved.remaining, reserved.allowance);
        }

        let noised = match noise::add_noise(values, sensitivity, epsilon) {
            Ok(noised) => noised,
            Err(err) => {
                // The epsilon stays spent; the audit trail records that.
                return Err(self.audit_rejection(
                    OperationKind::NoiseQuery,
                    data_source_id,
                    json!({
                        "data_category": data_category,
                        "epsilon_spent": reserved.epsilon,
                        "error": err.to_string(),
                    }),
                    now,
                    err,
                ));
            }
        };

        self.audit.append(
            OperationKind::NoiseQuery,
            data_source_id,
            json!({
                "data_category": data_category,
                "epsilon": reserved.epsilon,
                "sensitivity": sensitivity,
                "value_count": values.len(),
                "remaining_budget": reserved.remaining,
                "outcome": "ok",
            }),
            now,
        )?;
        tracing::debug!(
            target: "privgate.mediation",
            data_source_id,
            data_category,
            epsilon,
            "noise query mediated"
        );
        Ok(NoisedResult {
            noised_values: noised,
            epsilon_spent: reserved.epsilon,
            remaining_budget: reserved.remaining,
        })
    }

    /// Encrypt a record set under the category's policy. Calling this for
    /// a category whose policy does not require encryption is a usage
    /// error, not silently permitted.
    pub fn encrypt_dataset(
        &self,
        data_category: &str,
        values: &[f64],
    ) -> MediationResult<String> {
        let now = self.clock.now_unix();
        let policy = self.registry.lookup(data_category)?;
        if !policy.requires(Technique::Encryption) {
            let err = MediationError::PolicyMismatch {
                data_category: data_category.to_string(),
                technique: Technique::Encryption.as_str(),
            };
            self.events
                .policy_violation("technique_not_permitted", &err.to_string());
            return Err(self.audit_rejection(
                OperationKind::EncryptDataset,
                data_category,
                json!({"error": err.to_string()}),
                now,
                err,
            ));
        }

        match self.gateway.encrypt(values, data_category, now) {
            Ok(dataset_id) => {
                self.audit.append(
                    OperationKind::EncryptDataset,
                    &dataset_id,
                    json!({
                        "data_category": data_category,
                        "record_count": values.len(),
                        "scheme_id": self.gateway.scheme_id(),
                        "outcome": "ok",
                    }),
                    now,
                )?;
                Ok(dataset_id)
            }
            Err(err) => Err(self.audit_rejection(
                OperationKind::EncryptDataset,
                data_category,
                json!({"error": err.to_string()}),
                now,
                err,
            )),
        }
    }

    /// Homomorphic computation over a stored dataset. Logged regardless of
    /// outcome; repeated failures may indicate probing.
    pub fn compute_on_dataset(
        &self,
        dataset_id: &str,
        op: ComputeOp,
    ) -> MediationResult<Vec<u8>> {
        let now = self.clock.now_unix();
        match self.gateway.compute(dataset_id, op) {
            Ok(result) => {
                self.audit.append(
                    OperationKind::Compute,
                    dataset_id,
                    json!({"operation": op.as_str(), "outcome": "ok"}),
                    now,
                )?;
                Ok(result)
            }
            Err(err) => Err(self.audit_rejection(
                OperationKind::Compute,
                dataset_id,
                json!({"operation": op.as_str(), "error": err.to_string()}),
                now,
                err,
            )),
        }
    }

    /// Decrypt a ciphertext result; restricted to capability holders.
    pub fn decrypt_result(
        &self,
        blob: &[u8],
        capability: &DecryptCapability,
    ) -> MediationResult<Vec<f64>> {
        let now = self.clock.now_unix();
        match self.gateway.decrypt(blob, capability) {
            Ok(values) => {
                self.audit.append(
                    OperationKind::Decrypt,
                    "ciphertext",
                    json!({"value_count": values.len(), "outcome": "ok"}),
                    now,
                )?;
                Ok(values)
            }
            Err(err) => Err(self.audit_rejection(
                OperationKind::Decrypt,
                "ciphertext",
                json!({"error": err.to_string()}),
                now,
                err,
            )),
        }
    }

    /// Anonymize a record set through the fixed k-then-l pipeline.
    pub fn anonymize(
        &self,
        records: &[AnonRecord],
        k: usize,
        l: usize,
        suppression_threshold: f64,
    ) -> MediationResult<AnonymizationOutcome> {
        let now = self.clock.now_unix();
        match anonymize::anonymize(records, k, l, suppression_threshold) {
            Ok(outcome) => {
                self.audit.append(
                    OperationKind::Anonymize,
                    "records",
                    json!({
                        "k": k,
                        "l": l,
                        "input_count": records.len(),
                        "suppression_rate": outcome.suppression_rate,
                        "outcome": "ok",
                    }),
                    now,
                )?;
                Ok(outcome)
            }
            Err(err) => {
                if let MediationError::SuppressionThresholdExceeded { rate, .. } = &err {
                    self.events.policy_violation(
                        "suppression_threshold_exceeded",
                        &format!("suppression rate {rate}"),
                    );
                }
                Err(self.audit_rejection(
                    OperationKind::Anonymize,
                    "records",
                    json!({"k": k, "l": l, "error": err.to_string()}),
                    now,
                    err,
                ))
            }
        }
    }

    /// Anonymization gated by a category's policy flag, for callers that
    /// route record sets by data category.
    pub fn anonymize_for_category(
        &self,
        data_category: &str,
        records: &[AnonRecord],
        k: usize,
        l: usize,
        suppression_threshold: f64,
    ) -> MediationResult<AnonymizationOutcome> {
        let policy = self.registry.lookup(data_category)?;
        if !policy.anonymization_required && !policy.requires(Technique::Anonymization) {
            let err = MediationError::PolicyMismatch {
                data_category: data_category.to_string(),
                technique: Technique::Anonymization.as_str(),
            };
            self.events
                .policy_violation("technique_not_permitted", &err.to_string());
            let now = self.clock.now_unix();
            return Err(self.audit_rejection(
                OperationKind::Anonymize,
                data_category,
                json!({"error": err.to_string()}),
                now,
                err,
            ));
        }
        self.anonymize(records, k, l, suppression_threshold)
    }

    pub fn budget_status(&self, data_source_id: &str) -> BudgetStatus {
        self.ledger.status(data_source_id)
    }

    pub fn audit_trail(&self, limit: usize) -> Vec<AuditRecord> {
        self.audit.query(&AuditFilter {
            limit: Some(limit),
            ..Default::default()
        })
    }

    /// Daily allowance sweep; audited when any account was reset.
    pub fn reset_budget_windows(&self) -> MediationResult<usize> {
        let now = self.clock.now_unix();
        let reset = self.ledger.reset_expired(now);
        if reset > 0 {
            self.audit.append(
                OperationKind::BudgetReset,
                "ledger",
                json!({"accounts_reset": reset}),
                now,
            )?;
        }
        Ok(reset)
    }

    /// Retention sweep over the audit log itself.
    pub fn prune_audit(&self) -> usize {
        self.audit.prune(self.clock.now_unix())
    }

    /// Retention sweep over stored datasets; audited when anything burned.
    pub fn purge_expired_datasets(&self) -> MediationResult<usize> {
        let now = self.clock.now_unix();
        let purged = self.gateway.purge_expired(&self.registry, now);
        if !purged.is_empty() {
            self.audit.append(
                OperationKind::DatasetPurge,
                "gateway",
                json!({"datasets_purged": purged.len()}),
                now,
            )?;
        }
        Ok(purged.len())
    }

    /// Periodic key regeneration; every dataset is re-encrypted before the
    /// retired key is discarded.
    pub fn rotate_gateway_keys(&self) -> MediationResult<usize> {
        let now = self.clock.now_unix();
        let rotated = self.gateway.rotate_keys()?;
        self.audit.append(
            OperationKind::KeyRotation,
            "gateway",
            json!({
                "scheme_id": self.gateway.scheme_id(),
                "datasets_reencrypted": rotated,
            }),
            now,
        )?;
        Ok(rotated)
    }

    /// Record the rejection, then hand back the original error unless the
    /// audit write itself failed, in which case the engine fails closed
    /// with `AuditWriteFailure`.
    fn audit_rejection(
        &self,
        kind: OperationKind,
        subject: &str,
        summary: serde_json::Value,
        now: u64,
        err: MediationError,
    ) -> MediationError {
        match self.audit.append(kind, subject, summary, now) {
            Ok(_) => err,
            Err(audit_err) => audit_err,
        }
    }
}
