//! Runtime configuration, read once at startup from a JSON file.

use crate::command::ToolPaths;
use crate::error::{Result, TlfsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tlfs/tlfs.json";

/// 1 MiB tape blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mountpoint: String,
    #[serde(alias = "database_path")]
    pub catalog_path: PathBuf,
    /// Only manage discovered drives with these device paths, if set.
    pub drive_paths: Vec<String>,
    /// Overrides the discovered medium changer.
    pub changer_path: Option<String>,
    pub log_level: String,
    pub block_size: usize,
    pub tools: ToolPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mountpoint: String::new(),
            catalog_path: PathBuf::from("/var/lib/tlfs/catalog.json"),
            drive_paths: Vec::new(),
            changer_path: None,
            log_level: "info".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            tools: ToolPaths::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TlfsError::config(format!(
                "cannot read {}: {}. Create it (see README) or pass --config",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| TlfsError::config(format!("parse {} failed: {}", path.display(), e)))
    }

    /// Checks the settings needed to mount.
    pub fn validate(&self) -> Result<()> {
        if self.mountpoint.len() < 2 {
            return Err(TlfsError::config(
                "mountpoint is not set; add \"mountpoint\": \"/mnt/tape\" to the configuration",
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(TlfsError::config(format!(
                "log_level '{}' must be one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.block_size < 512 || self.block_size > 16 * 1024 * 1024 {
            return Err(TlfsError::config(format!(
                "block_size {} must be between 512 bytes and 16 MiB",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_fill_missing_keys() {
        let file = write_config(r#"{ "mountpoint": "/mnt/tape" }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.mountpoint, "/mnt/tape");
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.tools.mtx, "/usr/sbin/mtx");
        assert_eq!(config.changer_path, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"{
                "mountpoint": "/srv/library",
                "catalog_path": "/tmp/catalog.json",
                "drive_paths": ["/dev/nst0", "/dev/nst1"],
                "changer_path": "/dev/sg4",
                "log_level": "debug",
                "block_size": 524288,
                "tools": { "mt": "/bin/mt" }
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.drive_paths.len(), 2);
        assert_eq!(config.changer_path.as_deref(), Some("/dev/sg4"));
        assert_eq!(config.tools.mt, "/bin/mt");
        assert_eq!(config.tools.lsscsi, "/usr/bin/lsscsi");
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(TlfsError::Config(_))));

        let config = Config {
            mountpoint: "/mnt/tape".into(),
            log_level: "loud".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            mountpoint: "/mnt/tape".into(),
            block_size: 8,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_or_broken_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/tlfs.json")),
            Err(TlfsError::Config(_))
        ));
        let file = write_config("{ not json");
        assert!(matches!(Config::load(file.path()), Err(TlfsError::Config(_))));
    }
}
