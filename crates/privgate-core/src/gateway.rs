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
use crate::policy::PolicyRegistry;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const MASKED_ADDITIVE_SCHEME_ID: &str = "masked-additive-v1";

const BLOB_MAGIC: [u8; 4] = *b"PGE1";
const BLOB_VERSION: u8 = 1;
const ALG_MASKED_ADDITIVE: u8 = 1;
const KIND_ELEMENT: u8 = 0;
const KEY_FP_LEN: usize = 4;
const NONCE_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 1 + 1 + 1 + KEY_FP_LEN + NONCE_LEN;
const BLOB_LEN: usize = HEADER_LEN + 4 + 16;

/// Fixed-point resolution for plaintext values inside the masked encoding.
const FIXED_POINT_SCALE: f64 = 1_000_000.0;
/// Largest representable plaintext magnitude.
const MAX_PLAINTEXT: f64 = 1.0e12;

/// Operations in the homomorphic operation set. For every supported `f`,
/// `decrypt(compute(encrypt(x), f)) == f(x)` must hold regardless of the
/// concrete scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeOp {
    Sum,
    Count,
    Mean,
}

impl ComputeOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            ComputeOp::Sum => "sum",
            ComputeOp::Count => "count",
            ComputeOp::Mean => "mean",
        }
    }

    const fn kind_byte(self) -> u8 {
        match self {
            ComputeOp::Sum => 1,
            ComputeOp::Count => 2,
            ComputeOp::Mean => 3,
        }
    }

    fn from_kind_byte(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(ComputeOp::Sum),
            2 => Some(ComputeOp::Count),
            3 => Some(ComputeOp::Mean),
            _ => None,
        }
    }
}

/// Keypair for one scheme. Held only inside the gateway, never serialized
/// to the audit log or returned to callers; `Debug` redacts the material.
pub struct KeyMaterial {
    scheme_id: String,
    public_key: Vec<u8>,
    private_key: Vec<u8>,
}

impl KeyMaterial {
    fn generate(scheme_id: &str) -> Self {
        let mut public_key = vec![0u8; 32];
        let mut private_key = vec![0u8; 32];
        OsRng.fill_bytes(&mut public_key);
        OsRng.fill_bytes(&mut private_key);
        Self {
            scheme_id: scheme_id.to_string(),
            public_key,
            private_key,
        }
    }

    pub fn scheme_id(&self) -> &str {
        &self.scheme_id
    }

    fn fingerprint(&self) -> [u8; KEY_FP_LEN] {
        let digest = Sha256::digest(&self.private_key);
        let mut fp = [0u8; KEY_FP_LEN];
        fp.copy_from_slice(&digest[..KEY_FP_LEN]);
        fp
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.private_key.iter_mut().for_each(|b| *b = 0);
        self.public_key.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("scheme_id", &self.scheme_id)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Token granting the holder permission to decrypt. Only mintable by the
/// gateway owner; external callers hold dataset ids, never this.
pub struct DecryptCapability {
    _priv: (),
}

/// Pluggable encryption scheme contract. The shipped mock is a reversible
/// masked encoding; a real partially-homomorphic scheme slots in behind
/// this trait with the round-trip property as its conformance test.
pub trait HomomorphicScheme: Send + Sync {
    fn scheme_id(&self) -> &'static str;
    fn supported_ops(&self) -> &'static [ComputeOp];
    fn generate_key(&self) -> KeyMaterial;
    fn encrypt(&self, key: &KeyMaterial, values: &[f64]) -> MediationResult<Vec<Vec<u8>>>;
    /// Ciphertext-domain evaluation; no key crosses this boundary.
    fn compute(&self, op: ComputeOp, ciphertexts: &[Vec<u8>]) -> MediationResult<Vec<u8>>;
    fn decrypt(&self, key: &KeyMaterial, blob: &[u8]) -> MediationResult<Vec<f64>>;
}

/// Additively homomorphic masked encoding: each value is fixed-point
/// encoded and offset by a keystream mask derived from
/// `(private_key, dataset nonce, element index)`. Summation in the
/// ciphertext domain is exact because the mask total is recomputable from
/// the key at decryption time.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaskedAdditiveScheme;

impl MaskedAdditiveScheme {
    pub fn new() -> Self {
        Self
    }

    fn mask(key: &KeyMaterial, nonce: &[u8; NONCE_LEN], index: u32) -> i128 {
        let mut hasher = Sha256::new();
        hasher.update(&key.private_key);
        hasher.update(nonce);
        hasher.update(index.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        i128::from_be_bytes(bytes)
    }

    fn frame(kind: u8, key_fp: &[u8; KEY_FP_LEN], nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(BLOB_LEN);
        blob.extend_from_slice(&BLOB_MAGIC);
        blob.push(BLOB_VERSION);
        blob.push(ALG_MASKED_ADDITIVE);
        blob.push(kind);
        blob.extend_from_slice(key_fp);
        blob.extend_from_slice(nonce);
        blob
    }

    fn parse(blob: &[u8]) -> MediationResult<ParsedBlob> {
        if blob.len() != BLOB_LEN {
            return Err(MediationError::InvalidArgument(
                "ciphertext has invalid length".to_string(),
            ));
        }
        if blob[0..4] != BLOB_MAGIC || blob[4] != BLOB_VERSION || blob[5] != ALG_MASKED_ADDITIVE {
            return Err(MediationError::InvalidArgument(
                "unsupported ciphertext format".to_string(),
            ));
        }
        let kind = blob[6];
        let mut key_fp = [0u8; KEY_FP_LEN];
        key_fp.copy_from_slice(&blob[7..7 + KEY_FP_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[7 + KEY_FP_LEN..HEADER_LEN]);
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&blob[HEADER_LEN..HEADER_LEN + 4]);
        let mut payload = [0u8; 16];
        payload.copy_from_slice(&blob[HEADER_LEN + 4..]);
        Ok(ParsedBlob {
            kind,
            key_fp,
            nonce,
            counter: u32::from_be_bytes(counter),
            payload: i128::from_be_bytes(payload),
        })
    }

    fn encode(value: f64) -> MediationResult<i128> {
        if !value.is_finite() || value.abs() > MAX_PLAINTEXT {
            return Err(MediationError::InvalidArgument(format!(
                "record value out of encodable range: {value}"
            )));
        }
        Ok((value * FIXED_POINT_SCALE).round() as i128)
    }
}

struct ParsedBlob {
    kind: u8,
    key_fp: [u8; KEY_FP_LEN],
    nonce: [u8; NONCE_LEN],
    counter: u32,
    payload: i128,
}

impl HomomorphicScheme for MaskedAdditiveScheme {
    fn scheme_id(&self) -> &'static str {
        MASKED_ADDITIVE_SCHEME_ID
    }

    fn supported_ops(&self) -> &'static [ComputeOp] {
        &[ComputeOp::Sum, ComputeOp::Count, ComputeOp::Mean]
    }

    fn generate_key(&self) -> KeyMaterial {
        KeyMaterial::generate(MASKED_ADDITIVE_SCHEME_ID)
    }

    fn encrypt(&self, key: &KeyMaterial, values: &[f64]) -> MediationResult<Vec<Vec<u8>>> {
        if values.is_empty() {
            return Err(MediationError::InvalidArgument(
                "cannot encrypt an empty record set".to_string(),
            ));
        }
        if values.len() > u32::MAX as usize {
            return Err(MediationError::InvalidArgument(
                "record set too large".to_string(),
            ));
        }
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let key_fp = key.fingerprint();

        let mut out = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            let index = index as u32;
            let encoded = Self::encode(*value)?;
            let masked = encoded.wrapping_add(Self::mask(key, &nonce, index));
            let mut blob = Self::frame(KIND_ELEMENT, &key_fp, &nonce);
            blob.extend_from_slice(&index.to_be_bytes());
            blob.extend_from_slice(&masked.to_be_bytes());
            out.push(blob);
        }
        Ok(out)
    }

    fn compute(&self, op: ComputeOp, ciphertexts: &[Vec<u8>]) -> MediationResult<Vec<u8>> {
        if !self.supported_ops().contains(&op) {
            return Err(MediationError::InvalidArgument(format!(
                "operation {} is outside the scheme's homomorphic operation set",
                op.as_str()
            )));
        }
        if ciphertexts.is_empty() {
            return Err(MediationError::InvalidArgument(
                "cannot compute over an empty ciphertext set".to_string(),
            ));
        }

        let mut elements = Vec::with_capacity(ciphertexts.len());
        for blob in ciphertexts {
            let parsed = Self::parse(blob)?;
            if parsed.kind != KIND_ELEMENT {
                return Err(MediationError::InvalidArgument(
                    "compute requires element ciphertexts".to_string(),
                ));
            }
            elements.push(parsed);
        }
        let key_fp = elements[0].key_fp;
        let nonce = elements[0].nonce;
        if elements
            .iter()
            .any(|e| e.nonce != nonce || e.key_fp != key_fp)
        {
            return Err(MediationError::InvalidArgument(
                "ciphertexts span multiple datasets or keys".to_string(),
            ));
        }
        // The mask total is reconstructed from indices 0..n at decryption,
        // so the element set must cover exactly that range.
        let mut seen = vec![false; elements.len()];
        for element in &elements {
            let index = element.counter as usize;
            if index >= seen.len() || seen[index] {
                return Err(MediationError::InvalidArgument(
                    "ciphertext indices must cover the full dataset".to_string(),
                ));
            }
            seen[index] = true;
        }

        let count = elements.len() as u32;
        let payload = match op {
            ComputeOp::Sum | ComputeOp::Mean => elements
                .iter()
                .fold(0i128, |acc, e| acc.wrapping_add(e.payload)),
            ComputeOp::Count => count as i128,
        };
        let mut blob = Self::frame(op.kind_byte(), &key_fp, &nonce);
        blob.extend_from_slice(&count.to_be_bytes());
        blob.extend_from_slice(&payload.to_be_bytes());
        Ok(blob)
    }

    fn decrypt(&self, key: &KeyMaterial, blob: &[u8]) -> MediationResult<Vec<f64>> {
        let parsed = Self::parse(blob)?;
        if parsed.key_fp != key.fingerprint() {
            return Err(MediationError::InvalidArgument(
                "ciphertext was not produced under this key".to_string(),
            ));
        }
        if parsed.kind == KIND_ELEMENT {
            let mask = Self::mask(key, &parsed.nonce, parsed.counter);
            let encoded = parsed.payload.wrapping_sub(mask);
            return Ok(vec![encoded as f64 / FIXED_POINT_SCALE]);
        }
        let op = ComputeOp::from_kind_byte(parsed.kind).ok_or_else(|| {
            MediationError::InvalidArgument("unknown ciphertext kind".to_string())
        })?;
        if parsed.counter == 0 {
            return Err(MediationError::InvalidArgument(
                "result ciphertext covers no elements".to_string(),
            ));
        }
        match op {
            ComputeOp::Count => Ok(vec![f64::from(parsed.counter)]),
            ComputeOp::Sum | ComputeOp::Mean => {
                let mask_total = (0..parsed.counter).fold(0i128, |acc, index| {
                    acc.wrapping_add(Self::mask(key, &parsed.nonce, index))
                });
                let encoded = parsed.payload.wrapping_sub(mask_total);
                let sum = encoded as f64 / FIXED_POINT_SCALE;
                match op {
                    ComputeOp::Mean => Ok(vec![sum / f64::from(parsed.counter)]),
                    _ => Ok(vec![sum]),
                }
            }
        }
    }
}

/// Ciphertext store entry. External callers only ever hold the `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedDataset {
    pub id: String,
    pub data_category: String,
    pub ciphertexts: Vec<Vec<u8>>,
    pub scheme_id: String,
    pub created_at: u64,
    pub access_count: u64,
}

struct KeyRing {
    active: Arc<KeyMaterial>,
    /// Present only during the rotation grace pass; datasets encrypted
    /// under this key are re-encrypted before it is discarded.
    retired: Option<Arc<KeyMaterial>>,
}

/// Owns ciphertext storage and key material; executes the constrained
/// operation set directly on ciphertexts. Index writes are serialized
/// through the `RwLock`, concurrent reads of distinct datasets proceed
/// without contention.
pub struct SecureGateway {
    scheme: Arc<dyn HomomorphicScheme>,
    keys: RwLock<KeyRing>,
    datasets: RwLock<HashMap<String, EncryptedDataset>>,
}

impl SecureGateway {
    pub fn new(scheme: Arc<dyn HomomorphicScheme>) -> Self {
        let active = Arc::new(scheme.generate_key());
        Self {
            scheme,
            keys: RwLock::new(KeyRing {
                active,
                retired: None,
            }),
            datasets: RwLock::new(HashMap::new()),
        }
    }

    pub fn scheme_id(&self) -> &'static str {
        self.scheme.scheme_id()
    }

    pub fn supported_ops(&self) -> &'static [ComputeOp] {
        self.scheme.supported_ops()
    }

    pub fn decrypt_capability(&self) -> DecryptCapability {
        DecryptCapability { _priv: () }
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.read().len()
    }

    /// Encrypt a record set and register it under a fresh opaque id.
    pub fn encrypt(
        &self,
        values: &[f64],
        data_category: &str,
        now: u64,
    ) -> MediationResult<String> {
        let active = self.keys.read().active.clone();
        let ciphertexts = self.scheme.encrypt(&active, values)?;
        let id = fresh_dataset_id();
        let dataset = EncryptedDataset {
            id: id.clone(),
            data_category: data_category.to_string(),
            ciphertexts,
            scheme_id: self.scheme.scheme_id().to_string(),
            created_at: now,
            access_count: 0,
        };
        self.datasets.write().insert(id.clone(), dataset);
        Ok(id)
    }

    /// Run one homomorphic operation over a dataset's ciphertexts. The
    /// access counter is bumped whether or not the operation succeeds, so
    /// repeated failing probes remain visible downstream.
    pub fn compute(&self, dataset_id: &str, op: ComputeOp) -> MediationResult<Vec<u8>> {
        let mut datasets = self.datasets.write();
        let dataset = datasets
            .get_mut(dataset_id)
            .ok_or_else(|| MediationError::DatasetNotFound(dataset_id.to_string()))?;
        dataset.access_count = dataset.access_count.saturating_add(1);
        if dataset.scheme_id != self.scheme.scheme_id() {
            return Err(MediationError::SchemeUnavailable(dataset.scheme_id.clone()));
        }
        self.scheme.compute(op, &dataset.ciphertexts)
    }

    /// Decrypt a ciphertext, restricted to holders of a capability token.
    /// During a rotation grace window both the active and the retired key
    /// are tried, so in-flight results stay decryptable until re-encryption
    /// completes.
    pub fn decrypt(
        &self,
        blob: &[u8],
        _capability: &DecryptCapability,
    ) -> MediationResult<Vec<f64>> {
        let (active, retired) = {
            let ring = self.keys.read();
            (ring.active.clone(), ring.retired.clone())
        };
        match self.scheme.decrypt(&active, blob) {
            Ok(values) => Ok(values),
            Err(err) => match retired {
                Some(old) => self.scheme.decrypt(&old, blob),
                None => Err(err),
            },
        }
    }

    pub fn access_count(&self, dataset_id: &str) -> MediationResult<u64> {
        self.datasets
            .read()
            .get(dataset_id)
            .map(|d| d.access_count)
            .ok_or_else(|| MediationError::DatasetNotFound(dataset_id.to_string()))
    }

    /// Explicit deletion: ciphertext bytes are zeroed before the index
    /// entry is unlinked.
    pub fn delete_dataset(&self, dataset_id: &str) -> MediationResult<()> {
        let mut datasets = self.datasets.write();
        match datasets.remove(dataset_id) {
            Some(mut dataset) => {
                zero_ciphertexts(&mut dataset.ciphertexts);
                Ok(())
            }
            None => Err(MediationError::DatasetNotFound(dataset_id.to_string())),
        }
    }

    /// Destroy datasets whose owning policy's retention elapsed. A dataset
    /// whose category no longer has a policy is purged as well: retention
    /// that cannot be verified is treated as expired.
    pub fn purge_expired(&self, registry: &PolicyRegistry, now: u64) -> Vec<String> {
        let mut datasets = self.datasets.write();
        let expired: Vec<String> = datasets
            .values()
            .filter(|dataset| match registry.lookup(&dataset.data_category) {
                Ok(policy) => now >= dataset.created_at.saturating_add(policy.retention_secs),
                Err(_) => true,
            })
            .map(|dataset| dataset.id.clone())
            .collect();
        for id in &expired {
            if let Some(mut dataset) = datasets.remove(id) {
                zero_ciphertexts(&mut dataset.ciphertexts);
            }
        }
        expired
    }

    /// Generate a fresh keypair and re-encrypt every stored dataset under
    /// it. The retired key lives only for the grace pass; once every
    /// dataset is re-encrypted it is discarded, so nothing is ever left
    /// decryptable only by a key that no longer exists.
    pub fn rotate_keys(&self) -> MediationResult<usize> {
        let retired = {
            let mut ring = self.keys.write();
            let previous = ring.active.clone();
            ring.active = Arc::new(self.scheme.generate_key());
            ring.retired = Some(previous.clone());
            previous
        };
        let active = self.keys.read().active.clone();

        let mut datasets = self.datasets.write();
        let mut rotated = 0usize;
        for dataset in datasets.values_mut() {
            let mut values = Vec::with_capacity(dataset.ciphertexts.len());
            for blob in &dataset.ciphertexts {
                let mut decrypted = self.scheme.decrypt(&retired, blob)?;
                values.append(&mut decrypted);
            }
            let fresh = self.scheme.encrypt(&active, &values)?;
            zero_ciphertexts(&mut dataset.ciphertexts);
            dataset.ciphertexts = fresh;
            rotated += 1;
        }
        drop(datasets);

        self.keys.write().retired = None;
        Ok(rotated)
    }

    /// Snapshot of the dataset index for durable persistence.
    pub fn export(&self) -> Vec<EncryptedDataset> {
        self.datasets.read().values().cloned().collect()
    }
}

fn zero_ciphertexts(ciphertexts: &mut [Vec<u8>]) {
    for blob in ciphertexts.iter_mut() {
        blob.iter_mut().for_each(|b| *b = 0);
    }
}

fn fresh_dataset_id() -> String {
    format!("{:016x}{:016x}", OsRng.next_u64(), OsRng.next_u64())
}
