use privgate_core::policy::PrivacyPolicy;
use privgate_core::{MediationError, MediationResult};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub default_allowance: f64,
    pub budget_window_secs: u64,
    pub audit_retention_secs: u64,
    pub max_body_bytes: usize,
    pub sweep_interval_secs: u64,
    pub key_rotation_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8470".to_string(),
            data_dir: PathBuf::from("./data"),
            default_allowance: 10.0,
            budget_window_secs: 86_400,
            audit_retention_secs: 31_536_000,
            max_body_bytes: 262_144,
            sweep_interval_secs: 3_600,
            key_rotation_interval_secs: 604_800,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen: std::env::var("PRIVGATE_LISTEN").unwrap_or(defaults.listen),
            data_dir: std::env::var("PRIVGATE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            default_allowance: read_env_f64(
                "PRIVGATE_DEFAULT_ALLOWANCE",
                defaults.default_allowance,
            ),
            budget_window_secs: read_env_u64(
                "PRIVGATE_BUDGET_WINDOW_SECS",
                defaults.budget_window_secs,
            ),
            audit_retention_secs: read_env_u64(
                "PRIVGATE_AUDIT_RETENTION_SECS",
                defaults.audit_retention_secs,
            ),
            max_body_bytes: read_env_u64("PRIVGATE_MAX_BODY_BYTES", defaults.max_body_bytes as u64)
                as usize,
            sweep_interval_secs: read_env_u64(
                "PRIVGATE_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
            key_rotation_interval_secs: read_env_u64(
                "PRIVGATE_KEY_ROTATION_INTERVAL_SECS",
                defaults.key_rotation_interval_secs,
            ),
        }
    }
}

fn read_env_u64(key: &str, default_value: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_f64(key: &str, default_value: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(default_value)
}

/// Load the policy snapshot from a JSON file. Missing or malformed
/// configuration fails closed here, before the engine serves anything.
pub fn load_policies(path: &Path) -> MediationResult<Vec<PrivacyPolicy>> {
    let payload = std::fs::read(path).map_err(|err| {
        MediationError::Configuration(format!("cannot read policy file {}: {err}", path.display()))
    })?;
    serde_json::from_slice(&payload).map_err(|err| {
        MediationError::Configuration(format!(
            "cannot parse policy file {}: {err}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DaemonConfig::default();
        assert!(cfg.default_allowance > 0.0);
        assert_eq!(cfg.budget_window_secs, 86_400);
        assert_eq!(cfg.audit_retention_secs, 31_536_000);
    }

    #[test]
    fn load_policies_round_trips_a_valid_file() {
        let dir = tempfile::TempDir::new().expect("tmp");
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            serde_json::json!([{
                "id": "p1",
                "data_category": "location",
                "privacy_level": "high",
                "required_techniques": ["noise"],
                "retention_secs": 86400
            }])
            .to_string(),
        )
        .expect("write");

        let policies = load_policies(&path).expect("load");
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].data_category, "location");
    }

    #[test]
    fn load_policies_fails_closed_on_missing_or_invalid_files() {
        let dir = tempfile::TempDir::new().expect("tmp");
        assert!(matches!(
            load_policies(&dir.path().join("absent.json")),
            Err(MediationError::Configuration(_))
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{not json").expect("write");
        assert!(matches!(
            load_policies(&bad),
            Err(MediationError::Configuration(_))
        ));
    }
}
