use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};

use crate::error::ConfigError;

/// Release channel of the external version manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Release,
    Snapshot,
}

/// Which server loader the installation runs on.
///
/// Anything other than [`LoaderKind::Vanilla`] is covered by Safe Update
/// Protection: the orchestrator never replaces a modded jar automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoaderKind {
    Vanilla,
    Forge,
    NeoForge,
}

impl LoaderKind {
    pub fn is_modded(&self) -> bool {
        !matches!(self, LoaderKind::Vanilla)
    }
}

/// How the server process is launched.
///
/// `java_args` carries everything up to the jar itself, memory flags
/// included. `java_bin` exists so tests and exotic installs can point at a
/// different executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub jar_path: PathBuf,
    pub java_bin: String,
    pub java_args: Vec<String>,
    pub working_dir: PathBuf,
    pub use_gui_console: bool,
}

impl LaunchSpec {
    pub fn new(working_dir: impl Into<PathBuf>, jar_path: impl Into<PathBuf>) -> Self {
        Self {
            jar_path: jar_path.into(),
            java_bin: "java".to_string(),
            java_args: Vec::new(),
            working_dir: working_dir.into(),
            use_gui_console: false,
        }
    }

    pub fn with_memory(mut self, memory: &str) -> Self {
        self.java_args.push(format!("-Xmx{memory}"));
        self.java_args.push(format!("-Xms{memory}"));
        self
    }

    /// Absolute path of the jar the process runs from.
    pub fn jar_abs(&self) -> PathBuf {
        if self.jar_path.is_absolute() {
            self.jar_path.clone()
        } else {
            self.working_dir.join(&self.jar_path)
        }
    }
}

/// Persistent manager settings, read as an immutable snapshot per operation
/// cycle. Mirrors the on-disk JSON config; unknown keys are ignored and
/// missing keys fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub installed_version: String,
    pub loader: LoaderKind,
    pub update_to_snapshot: bool,
    pub check_updates: bool,
    pub max_backups: usize,
    pub enable_auto_restart: bool,
    pub crash_retry_limit: u32,
    pub enable_schedule: bool,
    pub restart_interval_hours: f64,
    pub update_poll_secs: u64,
    pub stop_timeout_secs: u64,
    pub server_memory: String,
    pub world_dir: PathBuf,
    pub world_backup_dir: PathBuf,
    pub jar_backup_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            installed_version: String::new(),
            loader: LoaderKind::Vanilla,
            update_to_snapshot: false,
            check_updates: true,
            max_backups: 3,
            enable_auto_restart: true,
            crash_retry_limit: 3,
            enable_schedule: false,
            restart_interval_hours: 12.0,
            update_poll_secs: 1800,
            stop_timeout_secs: 60,
            server_memory: "2G".to_string(),
            world_dir: PathBuf::from("world"),
            world_backup_dir: PathBuf::from("world_backups"),
            jar_backup_dir: PathBuf::from("jar_backups"),
        }
    }
}

impl ManagerConfig {
    /// Channel the update check should query, derived from the snapshot flag.
    pub fn channel(&self) -> Channel {
        if self.update_to_snapshot {
            Channel::Snapshot
        } else {
            Channel::Release
        }
    }

    /// Clamps invalid values back to their defaults rather than failing:
    /// a bad memory string or non-positive interval in a hand-edited config
    /// must not keep the server down.
    pub fn validate(mut self) -> Self {
        let mem_re = Regex::new(r"(?i)^\d+[GM]$").unwrap();
        if !mem_re.is_match(&self.server_memory) {
            self.server_memory = "2G".to_string();
        } else {
            self.server_memory = self.server_memory.to_uppercase();
        }

        if !self.restart_interval_hours.is_finite() || self.restart_interval_hours <= 0.0 {
            self.restart_interval_hours = 12.0;
        }

        if self.max_backups == 0 {
            self.max_backups = 1;
        }

        self
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read(path).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: ManagerConfig = serde_json::from_slice(&data)?;
        Ok(config.validate())
    }

    /// Loads the config, falling back to validated defaults when the file
    /// does not exist yet.
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::metadata(path).await {
            Ok(_) => Self::load(path).await,
            Err(_) => Ok(Self::default().validate()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self)?;

        let mut file = fs::File::create(path).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.write_all(&json).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_memory_falls_back() {
        let config = ManagerConfig {
            server_memory: "lots".to_string(),
            ..Default::default()
        }
        .validate();
        assert_eq!(config.server_memory, "2G");
    }

    #[test]
    fn memory_is_uppercased() {
        let config = ManagerConfig {
            server_memory: "4g".to_string(),
            ..Default::default()
        }
        .validate();
        assert_eq!(config.server_memory, "4G");
    }

    #[test]
    fn non_positive_interval_falls_back() {
        let config = ManagerConfig {
            restart_interval_hours: -2.0,
            ..Default::default()
        }
        .validate();
        assert_eq!(config.restart_interval_hours, 12.0);
    }

    #[test]
    fn snapshot_flag_selects_channel() {
        let mut config = ManagerConfig::default();
        assert_eq!(config.channel(), Channel::Release);
        config.update_to_snapshot = true;
        assert_eq!(config.channel(), Channel::Snapshot);
    }

    #[test]
    fn partial_json_gets_defaults() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"update_to_snapshot": true}"#).unwrap();
        assert!(config.update_to_snapshot);
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.server_memory, "2G");
    }

    #[tokio::test]
    async fn config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.json");

        let mut config = ManagerConfig::default();
        config.installed_version = "1.21.4".to_string();
        config.loader = LoaderKind::Forge;
        config.save(&path).await.unwrap();

        let loaded = ManagerConfig::load(&path).await.unwrap();
        assert_eq!(loaded.installed_version, "1.21.4");
        assert_eq!(loaded.loader, LoaderKind::Forge);
    }

    #[test]
    fn launch_spec_memory_args() {
        let spec = LaunchSpec::new(".", "server.jar").with_memory("2G");
        assert_eq!(spec.java_args, vec!["-Xmx2G", "-Xms2G"]);
    }
}
