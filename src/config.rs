use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Maximum config file size (1 MB).
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Top-level guard configuration, loaded from `rootguard.json`.
///
/// Every field has a secure default; a partial file only overrides what it
/// names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_safe_root")]
    pub safe_root: PathBuf,
    #[serde(default)]
    pub allowed_prefixes: Vec<PathBuf>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    /// Upper bound for any single file the provenance layer hashes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

/// Recovery strategy for the self-healing validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Recovery attempts per logical path before it fails fast.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Also create the final path component as a directory. Off by default:
    /// a missing file is not something directory creation can restore.
    #[serde(default)]
    pub materialize_leaf: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Seconds between scheduled snapshots; `0` disables the scheduler.
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub dag_tracking: bool,
}

/// Thresholds for the governance recorder's policy set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceConfig {
    #[serde(default = "default_max_recoveries_per_window")]
    pub max_recoveries_per_window: u32,
    #[serde(default = "default_recovery_window")]
    pub recovery_window_secs: u64,
    #[serde(default = "default_max_snapshot_age")]
    pub max_snapshot_age_secs: u64,
}

fn default_safe_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_snapshot_interval() -> u64 {
    300
}

fn default_max_recoveries_per_window() -> u32 {
    3
}

fn default_recovery_window() -> u64 {
    600
}

fn default_max_snapshot_age() -> u64 {
    900
}

fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024 // 100MB
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            materialize_leaf: false,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_snapshot_interval(),
            dag_tracking: true,
        }
    }
}

impl SnapshotConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            max_recoveries_per_window: default_max_recoveries_per_window(),
            recovery_window_secs: default_recovery_window(),
            max_snapshot_age_secs: default_max_snapshot_age(),
        }
    }
}

impl ComplianceConfig {
    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }

    pub fn max_snapshot_age(&self) -> Duration {
        Duration::from_secs(self.max_snapshot_age_secs)
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            safe_root: default_safe_root(),
            allowed_prefixes: Vec::new(),
            recovery: RecoveryConfig::default(),
            snapshots: SnapshotConfig::default(),
            compliance: ComplianceConfig::default(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

impl GuardConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Ok(serde_json::from_slice(&crate::fs_guard::read_validated(
                p,
                MAX_CONFIG_BYTES,
            )?)?),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_values() {
        let config = GuardConfig::default();
        assert_eq!(config.safe_root, PathBuf::from("."));
        assert!(config.allowed_prefixes.is_empty());
        assert!(config.recovery.enabled);
        assert_eq!(config.recovery.max_attempts, 3);
        assert!(!config.recovery.materialize_leaf);
        assert!(config.snapshots.dag_tracking);
        assert_eq!(config.snapshots.interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.compliance.max_recoveries_per_window, 3);
    }

    #[test]
    fn test_load_none_returns_default() {
        let config = GuardConfig::load(None).unwrap();
        assert_eq!(config.recovery, RecoveryConfig::default());
        assert_eq!(config.snapshots, SnapshotConfig::default());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "safe_root": "/srv/build",
                "recovery": {{ "max_attempts": 5 }},
                "snapshots": {{ "interval_secs": 0 }}
            }}"#
        )
        .unwrap();

        let config = GuardConfig::load(Some(f.path())).unwrap();
        assert_eq!(config.safe_root, PathBuf::from("/srv/build"));
        assert_eq!(config.recovery.max_attempts, 5);
        assert!(config.recovery.enabled);
        assert_eq!(config.snapshots.interval(), None);
        assert!(config.snapshots.dag_tracking);
        assert_eq!(config.compliance, ComplianceConfig::default());
    }

    #[test]
    fn test_load_invalid_json_fails() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "not valid json").unwrap();
        assert!(GuardConfig::load(Some(f.path())).is_err());
    }

    #[test]
    fn test_load_nonexistent_file_fails() {
        let result = GuardConfig::load(Some(Path::new("/nonexistent/rootguard.json")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let big_file = dir.path().join("huge.json");
        #[allow(clippy::cast_possible_truncation)]
        let data = vec![b' '; (MAX_CONFIG_BYTES as usize) + 1];
        std::fs::write(&big_file, &data).unwrap();

        let err = GuardConfig::load(Some(&big_file)).unwrap_err().to_string();
        assert!(err.contains("too large"), "error should mention size: {err}");
    }
}
