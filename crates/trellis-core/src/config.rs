//! Core configuration, parsed from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings the control-plane core consumes. Everything has a default so a
/// missing or partial file still yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Versions retained per run spec before GC may delete the oldest.
    #[serde(default = "default_max_versions")]
    pub max_versions: u32,
    /// Root-group versions retained before GC may delete the oldest.
    #[serde(default = "default_max_root_versions")]
    pub max_root_versions: u32,
    /// Seconds between automatic GC scans. Zero disables the timer; GC
    /// then runs only on demand.
    #[serde(default)]
    pub gc_scan_interval_secs: u64,
    /// Maximum concurrently in-flight kill requests.
    #[serde(default = "default_kill_chunk_size")]
    pub kill_chunk_size: usize,
    /// Seconds before an unanswered kill request is re-issued.
    #[serde(default = "default_kill_retry_timeout_secs")]
    pub kill_retry_timeout_secs: u64,
    /// Default Mesos resource role for run specs that declare none.
    #[serde(default = "default_mesos_role")]
    pub mesos_role: String,
    #[serde(default = "default_framework_name")]
    pub framework_name: String,
}

fn default_max_versions() -> u32 {
    50
}

fn default_max_root_versions() -> u32 {
    25
}

fn default_kill_chunk_size() -> usize {
    5
}

fn default_kill_retry_timeout_secs() -> u64 {
    600
}

fn default_mesos_role() -> String {
    "*".to_string()
}

fn default_framework_name() -> String {
    "trellis".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_versions: default_max_versions(),
            max_root_versions: default_max_root_versions(),
            gc_scan_interval_secs: 0,
            kill_chunk_size: default_kill_chunk_size(),
            kill_retry_timeout_secs: default_kill_retry_timeout_secs(),
            mesos_role: default_mesos_role(),
            framework_name: default_framework_name(),
        }
    }
}

impl CoreConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn kill_retry_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_retry_timeout_secs)
    }

    pub fn gc_scan_interval(&self) -> Option<Duration> {
        (self.gc_scan_interval_secs > 0)
            .then(|| Duration::from_secs(self.gc_scan_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_an_empty_document() {
        let config: CoreConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_versions, 50);
        assert_eq!(config.kill_chunk_size, 5);
        assert_eq!(config.kill_retry_timeout_secs, 600);
        assert_eq!(config.mesos_role, "*");
        assert!(config.gc_scan_interval().is_none());
    }

    #[test]
    fn partial_document_overrides_selected_fields() {
        let config: CoreConfig = toml::from_str(
            r#"
max_versions = 3
gc_scan_interval_secs = 30
kill_chunk_size = 2
"#,
        )
        .unwrap();
        assert_eq!(config.max_versions, 3);
        assert_eq!(config.gc_scan_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.kill_chunk_size, 2);
        assert_eq!(config.max_root_versions, 25);
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellis.toml");
        std::fs::write(&path, "mesos_role = \"prod\"\n").unwrap();
        let config = CoreConfig::from_file(&path).unwrap();
        assert_eq!(config.mesos_role, "prod");
    }
}
