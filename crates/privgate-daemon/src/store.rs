use privgate_core::audit::{AuditRecord, AuditSink};
use privgate_core::budget::BudgetAccount;
use privgate_core::gateway::EncryptedDataset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
fn sync_directory(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn write_file_atomic_durable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path parent missing"))?;
    let tmp = path.with_extension("tmp");
    let mut f = File::create(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    std::fs::rename(&tmp, path)?;
    sync_directory(parent)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct BudgetFile {
    accounts: HashMap<String, BudgetAccount>,
}

/// Durable snapshot of the budget ledger, keyed by data source id.
#[derive(Debug)]
pub struct BudgetStore {
    path: PathBuf,
}

impl BudgetStore {
    pub fn open(root: &Path) -> Self {
        Self {
            path: root.join("budget.json"),
        }
    }

    pub fn load(&self) -> std::io::Result<HashMap<String, BudgetAccount>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = std::fs::read(&self.path)?;
        let file: BudgetFile = serde_json::from_slice(&bytes)
            .map_err(|err| std::io::Error::other(format!("decode budget snapshot: {err}")))?;
        Ok(file.accounts)
    }

    pub fn persist(&self, accounts: &HashMap<String, BudgetAccount>) -> std::io::Result<()> {
        let payload = serde_json::to_vec_pretty(&BudgetFile {
            accounts: accounts.clone(),
        })
        .map_err(|err| std::io::Error::other(format!("encode budget snapshot: {err}")))?;
        write_file_atomic_durable(&self.path, &payload)
    }
}

/// Append-only JSONL audit sink with time-based prune. Each append is
/// fsynced before the engine acknowledges the triggering operation.
#[derive(Debug)]
pub struct AuditFileSink {
    path: PathBuf,
}

impl AuditFileSink {
    pub fn open(root: &Path) -> Self {
        Self {
            path: root.join("audit.jsonl"),
        }
    }

    pub fn load(&self) -> std::io::Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .map_err(|err| std::io::Error::other(format!("decode audit record: {err}")))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Rewrite the file keeping only records at or after `cutoff`.
    pub fn prune_before(&self, cutoff: u64) -> std::io::Result<usize> {
        let records = self.load()?;
        let kept: Vec<&AuditRecord> = records.iter().filter(|r| r.timestamp >= cutoff).collect();
        let pruned = records.len() - kept.len();
        if pruned == 0 {
            return Ok(0);
        }
        let mut payload = Vec::new();
        for record in kept {
            serde_json::to_writer(&mut payload, record)
                .map_err(|err| std::io::Error::other(format!("encode audit record: {err}")))?;
            payload.push(b'\n');
        }
        write_file_atomic_durable(&self.path, &payload)?;
        Ok(pruned)
    }
}

impl AuditSink for AuditFileSink {
    fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|err| std::io::Error::other(format!("encode audit record: {err}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DatasetFile {
    datasets: Vec<EncryptedDataset>,
}

/// Durable dataset index. Keys never leave the gateway process, so after a
/// restart persisted ciphertexts are only decryptable by discarded keys;
/// `clear_stale` destroys them the way the retention purge would.
#[derive(Debug)]
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn open(root: &Path) -> Self {
        Self {
            path: root.join("datasets.json"),
        }
    }

    pub fn persist(&self, datasets: &[EncryptedDataset]) -> std::io::Result<()> {
        let payload = serde_json::to_vec(&DatasetFile {
            datasets: datasets.to_vec(),
        })
        .map_err(|err| std::io::Error::other(format!("encode dataset index: {err}")))?;
        write_file_atomic_durable(&self.path, &payload)
    }

    pub fn load(&self) -> std::io::Result<Vec<EncryptedDataset>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path)?;
        let file: DatasetFile = serde_json::from_slice(&bytes)
            .map_err(|err| std::io::Error::other(format!("decode dataset index: {err}")))?;
        Ok(file.datasets)
    }

    /// Zero and drop every persisted dataset. Returns how many were
    /// destroyed.
    pub fn clear_stale(&self) -> std::io::Result<usize> {
        let mut datasets = self.load()?;
        if datasets.is_empty() {
            return Ok(0);
        }
        for dataset in &mut datasets {
            for blob in &mut dataset.ciphertexts {
                blob.iter_mut().for_each(|b| *b = 0);
            }
        }
        // overwrite with the zeroed blobs first, then drop the index
        self.persist(&datasets)?;
        self.persist(&[])?;
        Ok(datasets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use privgate_core::audit::OperationKind;
    use privgate_core::budget::{BudgetLedger, DEFAULT_WINDOW_SECS};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn budget_store_round_trips_ledger_snapshots() {
        let tmp = TempDir::new().expect("tmp");
        let store = BudgetStore::open(tmp.path());
        let ledger = BudgetLedger::new(10.0, DEFAULT_WINDOW_SECS).expect("ledger");
        ledger.reserve("src1", 2.5, 100).expect("reserve");

        store.persist(&ledger.export()).expect("persist");
        let restored = store.load().expect("load");
        assert_eq!(restored.len(), 1);

        let fresh = BudgetLedger::new(10.0, DEFAULT_WINDOW_SECS).expect("ledger");
        fresh.restore(restored).expect("restore");
        assert!((fresh.status("src1").consumed - 2.5).abs() < 1e-12);
    }

    #[test]
    fn budget_persist_is_atomic_when_write_fails() {
        let tmp = TempDir::new().expect("tmp");
        let store = BudgetStore::open(tmp.path());
        std::fs::write(store.path.clone(), b"{\"accounts\":{}}").expect("seed");

        // block temp-file creation so the write fails before the rename
        std::fs::create_dir(store.path.with_extension("tmp")).expect("block tmp");
        let ledger = BudgetLedger::new(5.0, DEFAULT_WINDOW_SECS).expect("ledger");
        ledger.reserve("src", 1.0, 0).expect("reserve");
        assert!(store.persist(&ledger.export()).is_err());
        assert_eq!(
            std::fs::read(&store.path).expect("original intact"),
            b"{\"accounts\":{}}".to_vec()
        );
    }

    #[test]
    fn audit_sink_appends_and_prunes() {
        let tmp = TempDir::new().expect("tmp");
        let sink = AuditFileSink::open(tmp.path());
        for (id, ts) in [(0u64, 10u64), (1, 20), (2, 30)] {
            sink.append(&AuditRecord {
                id,
                kind: OperationKind::Reserve,
                subject: "src".to_string(),
                summary: json!({"epsilon": 0.5}),
                timestamp: ts,
            })
            .expect("append");
        }
        assert_eq!(sink.load().expect("load").len(), 3);

        assert_eq!(sink.prune_before(25).expect("prune"), 2);
        let kept = sink.load().expect("load");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].timestamp, 30);

        assert_eq!(sink.prune_before(25).expect("noop"), 0);
    }

    #[test]
    fn dataset_store_clears_stale_ciphertexts() {
        let tmp = TempDir::new().expect("tmp");
        let store = DatasetStore::open(tmp.path());
        store
            .persist(&[EncryptedDataset {
                id: "ds1".to_string(),
                data_category: "payments".to_string(),
                ciphertexts: vec![vec![1, 2, 3]],
                scheme_id: "masked-additive-v1".to_string(),
                created_at: 0,
                access_count: 0,
            }])
            .expect("persist");

        assert_eq!(store.clear_stale().expect("clear"), 1);
        assert!(store.load().expect("load").is_empty());
        assert_eq!(store.clear_stale().expect("noop"), 0);
    }
}
