// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{MediationError, MediationResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A privacy technique a policy may require. Every entry must be backed by
/// a registered mechanism before the registry accepts the policy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    Noise,
    Encryption,
    Anonymization,
}

impl Technique {
    pub const fn as_str(self) -> &'static str {
        match self {
            Technique::Noise => "noise",
            Technique::Encryption => "encryption",
            Technique::Anonymization => "anonymization",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Immutable per-category privacy requirements. Looked up by
/// `data_category`; never mutated after the registry snapshot is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    pub id: String,
    pub data_category: String,
    pub privacy_level: PrivacyLevel,
    pub required_techniques: BTreeSet<Technique>,
    pub retention_secs: u64,
    #[serde(default)]
    pub access_tags: BTreeSet<String>,
    #[serde(default)]
    pub anonymization_required: bool,
}

impl PrivacyPolicy {
    pub fn requires(&self, technique: Technique) -> bool {
        self.required_techniques.contains(&technique)
    }
}

/// The set of techniques the running engine can actually execute. A policy
/// requiring anything outside this set is invalid configuration.
#[derive(Debug, Clone, Default)]
pub struct RegisteredMechanisms {
    techniques: BTreeSet<Technique>,
}

impl RegisteredMechanisms {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self::none()
            .with(Technique::Noise)
            .with(Technique::Encryption)
            .with(Technique::Anonymization)
    }

    pub fn with(mut self, technique: Technique) -> Self {
        self.techniques.insert(technique);
        self
    }

    pub fn supports(&self, technique: Technique) -> bool {
        self.techniques.contains(&technique)
    }
}

type PolicySnapshot = Arc<HashMap<String, Arc<PrivacyPolicy>>>;

/// Read-mostly registry of privacy policies keyed by data category.
///
/// Reads never block on a reload: a reload validates the full replacement
/// set first and then swaps in a new immutable snapshot, so readers observe
/// either the fully-old or the fully-new policy set.
#[derive(Debug)]
pub struct PolicyRegistry {
    snapshot: RwLock<PolicySnapshot>,
}

impl PolicyRegistry {
    /// Build a registry from a policy set, failing closed on invalid
    /// configuration. Undefined privacy requirements must never be treated
    /// as "no protection needed", so there is no default policy.
    pub fn load(
        policies: Vec<PrivacyPolicy>,
        registered: &RegisteredMechanisms,
    ) -> MediationResult<Self> {
        let snapshot = validate(policies, registered)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Atomically replace the policy set. The replacement is validated in
    /// full before the swap; on error the old snapshot stays in place.
    pub fn reload(
        &self,
        policies: Vec<PrivacyPolicy>,
        registered: &RegisteredMechanisms,
    ) -> MediationResult<()> {
        let next = Arc::new(validate(policies, registered)?);
        *self.snapshot.write() = next;
        Ok(())
    }

    pub fn lookup(&self, data_category: &str) -> MediationResult<Arc<PrivacyPolicy>> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .get(data_category)
            .cloned()
            .ok_or_else(|| MediationError::PolicyNotFound(data_category.to_string()))
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        self.snapshot.read().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }
}

fn validate(
    policies: Vec<PrivacyPolicy>,
    registered: &RegisteredMechanisms,
) -> MediationResult<HashMap<String, Arc<PrivacyPolicy>>> {
    let mut out = HashMap::with_capacity(policies.len());
    for policy in policies {
        if policy.id.is_empty() {
            return Err(MediationError::Configuration(
                "policy id must be non-empty".to_string(),
            ));
        }
        if policy.data_category.is_empty() {
            return Err(MediationError::Configuration(format!(
                "policy {} has an empty data_category",
                policy.id
            )));
        }
        if policy.retention_secs == 0 {
            return Err(MediationError::Configuration(format!(
                "policy {} has a zero retention window",
                policy.id
            )));
        }
        for technique in &policy.required_techniques {
            if !registered.supports(*technique) {
                return Err(MediationError::Configuration(format!(
                    "policy {} requires technique {} with no registered mechanism",
                    policy.id,
                    technique.as_str()
                )));
            }
        }
        if policy.anonymization_required && !registered.supports(Technique::Anonymization) {
            return Err(MediationError::Configuration(format!(
                "policy {} requires anonymization with no registered mechanism",
                policy.id
            )));
        }
        let category = policy.data_category.clone();
        if out.insert(category, Arc::new(policy)).is_some() {
            return Err(MediationError::Configuration(
                "duplicate data_category in policy set".to_string(),
            ));
        }
    }
    Ok(out)
}
