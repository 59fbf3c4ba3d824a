//! Configuration file handling
//!
//! Everything has a default, so an empty file (or no file at all) gives a
//! provider rooted at the current directory listening on localhost.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::AccessDetails;
use crate::operations::{FileError, FileManager, ProviderOptions};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Configuration for the file manager service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name of the root folder
    #[serde(default = "default_name")]
    pub name: String,

    /// Host directory every virtual path resolves under
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Role and ordered access rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest request body accepted (bytes)
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Append octet-stream parts to a partially uploaded file
    #[serde(default = "default_true")]
    pub chunked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { chunked: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            root: default_root(),
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            logging: LoggingConfig::default(),
            access: None,
        }
    }
}

fn default_name() -> String {
    "Files".to_string()
}
fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_max_upload_size() -> usize {
    512 * 1024 * 1024
} // 512MB
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Locations tried when no config path is given, in order.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("fileman.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("fileman").join("config.toml"));
        }
        paths
    }

    /// Build the provider this configuration describes.
    pub fn to_file_manager(&self) -> Result<FileManager, FileError> {
        let manager = FileManager::new(&self.root)?
            .with_access(self.access.clone())
            .with_options(ProviderOptions {
                chunked_uploads: self.upload.chunked,
                root_name: Some(self.name.clone()),
            });
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Permission;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.name, "Files");
        assert_eq!(config.server.port, 8090);
        assert!(config.upload.chunked);
        assert_eq!(config.logging.level, "info");
        assert!(config.access.is_none());
    }

    #[test]
    fn test_access_rules_from_toml() {
        let config: Config = toml::from_str(
            r#"
            root = "/srv/files"

            [access]
            role = "guest"

            [[access.rules]]
            path = "/Pictures"
            role = "guest"
            write = "deny"
            message = "Pictures are read-only"
            "#,
        )
        .unwrap();
        let access = config.access.unwrap();
        assert_eq!(access.role.as_deref(), Some("guest"));
        assert_eq!(access.rules.len(), 1);
        assert_eq!(access.rules[0].write, Permission::Deny);
        assert_eq!(access.rules[0].read, Permission::Allow);
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("fileman.toml");

        let mut config = Config::default();
        config.root = temp.path().to_path_buf();
        config.upload.chunked = false;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.root, temp.path());
        assert!(!loaded.upload.chunked);
    }

    #[test]
    fn test_to_file_manager() {
        let temp = tempdir().unwrap();
        let config = Config {
            name: "Shared".to_string(),
            root: temp.path().to_path_buf(),
            ..Default::default()
        };
        let manager = config.to_file_manager().unwrap();
        assert_eq!(manager.root_name(), "Shared");
        assert!(manager.options().chunked_uploads);
    }

    #[test]
    fn test_invalid_toml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("broken.toml");
        std::fs::write(&path, "root = [").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }
}
