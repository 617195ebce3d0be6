//! Configuration management with file persistence

mod store;

pub use store::ConfigStore;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Signature schemes accepted for `plugins.signature_scheme`
pub const SIGNATURE_SCHEMES: [&str; 2] = ["digest", "ed25519"];

/// Addinhost configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugin root directory. `None` falls back to `ADDINHOST_PLUGIN_DIR` or `~/.addinhost/plugins`
    pub directory: Option<PathBuf>,
    /// Require a `<assembly>.sig` sidecar for every plugin
    pub require_signature: bool,
    /// `digest` or `ed25519`
    pub signature_scheme: String,
    /// Base64 ed25519 public key of the trusted signer
    pub issuer_key: Option<String>,
    /// Permission names a plugin may be granted; requests outside this list are denied
    pub allowed_permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub request_timeout_ms: u64,
    /// Maximum pooled RPC envelopes kept per payload type
    pub pool_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub operation_timeout_secs: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            require_signature: false,
            signature_scheme: "digest".to_string(),
            issuer_key: None,
            allowed_permissions: vec!["All".to_string()],
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            pool_capacity: 64,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 30,
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl LifecycleConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl PluginsConfig {
    /// Resolve the plugin root directory
    pub fn plugin_dir(&self) -> anyhow::Result<PathBuf> {
        if let Ok(path) = env::var("ADDINHOST_PLUGIN_DIR") {
            return Ok(PathBuf::from(path));
        }
        if let Some(dir) = &self.directory {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".addinhost").join("plugins"))
            .ok_or_else(|| anyhow!("Unable to resolve plugin directory"))
    }
}

impl HostConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ADDINHOST_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("addinhost")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(HostConfig::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: HostConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !SIGNATURE_SCHEMES.contains(&self.plugins.signature_scheme.as_str()) {
            return Err(anyhow!(
                "Invalid signature scheme: {}. Valid options: {}",
                self.plugins.signature_scheme,
                SIGNATURE_SCHEMES.join(", ")
            ));
        }
        if self.plugins.require_signature
            && self.plugins.signature_scheme == "ed25519"
            && self.plugins.issuer_key.is_none()
        {
            return Err(anyhow!(
                "plugins.issuer_key is required when ed25519 signatures are enforced"
            ));
        }
        if self.bus.request_timeout_ms == 0 {
            return Err(anyhow!("bus.request_timeout_ms must be greater than zero"));
        }
        if self.lifecycle.operation_timeout_secs == 0 {
            return Err(anyhow!("lifecycle.operation_timeout_secs must be greater than zero"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "plugins.directory" => Ok(self
                .plugins
                .directory
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "(default)".to_string())),
            "plugins.require_signature" => Ok(self.plugins.require_signature.to_string()),
            "plugins.signature_scheme" => Ok(self.plugins.signature_scheme.clone()),
            "plugins.issuer_key" => Ok(self
                .plugins
                .issuer_key
                .clone()
                .unwrap_or_else(|| "(not set)".to_string())),
            "plugins.allowed_permissions" => Ok(self.plugins.allowed_permissions.join(", ")),

            "bus.request_timeout_ms" => Ok(self.bus.request_timeout_ms.to_string()),
            "bus.pool_capacity" => Ok(self.bus.pool_capacity.to_string()),

            "lifecycle.operation_timeout_secs" => {
                Ok(self.lifecycle.operation_timeout_secs.to_string())
            }

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `addinhost config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "plugins.directory" => {
                self.plugins.directory = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "plugins.require_signature" => {
                self.plugins.require_signature = value
                    .parse()
                    .with_context(|| format!("Invalid require_signature value: {}", value))?;
            }
            "plugins.signature_scheme" => {
                if !SIGNATURE_SCHEMES.contains(&value) {
                    return Err(anyhow!(
                        "Invalid signature scheme: {}. Valid options: {}",
                        value,
                        SIGNATURE_SCHEMES.join(", ")
                    ));
                }
                self.plugins.signature_scheme = value.to_string();
            }
            "plugins.issuer_key" => {
                self.plugins.issuer_key = if value.trim().is_empty() {
                    None
                } else {
                    Some(value.trim().to_string())
                };
            }
            "plugins.allowed_permissions" => {
                self.plugins.allowed_permissions = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }

            "bus.request_timeout_ms" => {
                let timeout: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid request_timeout_ms value: {}", value))?;
                if timeout == 0 {
                    return Err(anyhow!("Request timeout must be greater than zero"));
                }
                self.bus.request_timeout_ms = timeout;
            }
            "bus.pool_capacity" => {
                self.bus.pool_capacity = value
                    .parse()
                    .with_context(|| format!("Invalid pool_capacity value: {}", value))?;
            }

            "lifecycle.operation_timeout_secs" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid operation_timeout_secs value: {}", value))?;
                if secs == 0 {
                    return Err(anyhow!("Operation timeout must be greater than zero"));
                }
                self.lifecycle.operation_timeout_secs = secs;
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `addinhost config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "plugins.directory",
            "plugins.require_signature",
            "plugins.signature_scheme",
            "plugins.issuer_key",
            "plugins.allowed_permissions",
            "bus.request_timeout_ms",
            "bus.pool_capacity",
            "lifecycle.operation_timeout_secs",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = HostConfig::default();

        assert!(config.plugins.directory.is_none());
        assert!(!config.plugins.require_signature);
        assert_eq!(config.plugins.signature_scheme, "digest");
        assert_eq!(config.plugins.allowed_permissions, vec!["All".to_string()]);
        assert_eq!(config.bus.request_timeout_ms, 5_000);
        assert_eq!(config.bus.pool_capacity, 64);
        assert_eq!(config.lifecycle.operation_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_set_and_get_roundtrip() {
        let mut config = HostConfig::default();
        config.set("bus.request_timeout_ms", "250").unwrap();
        config.set("plugins.allowed_permissions", "FileSystem, Network").unwrap();
        config.set("plugins.require_signature", "true").unwrap();

        assert_eq!(config.get("bus.request_timeout_ms").unwrap(), "250");
        assert_eq!(config.bus.request_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.plugins.allowed_permissions,
            vec!["FileSystem".to_string(), "Network".to_string()]
        );
        assert!(config.plugins.require_signature);
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = HostConfig::default();
        assert!(config.set("bus.request_timeout_ms", "0").is_err());
        assert!(config.set("bus.request_timeout_ms", "soon").is_err());
        assert!(config.set("plugins.signature_scheme", "md5").is_err());
        assert!(config.set("lifecycle.operation_timeout_secs", "0").is_err());
        assert!(config.set("nope", "1").is_err());
        assert!(config.get("nope").is_err());
    }

    #[test]
    fn test_validate_requires_issuer_key_for_ed25519() {
        let mut config = HostConfig::default();
        config.plugins.require_signature = true;
        config.plugins.signature_scheme = "ed25519".to_string();
        assert!(config.validate().is_err());

        config.plugins.issuer_key = Some("AAAA".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = HostConfig::default();
        config.set("bus.pool_capacity", "8").unwrap();
        config.set("plugins.directory", "/opt/addins").unwrap();
        config.save_to(&path).unwrap();

        let loaded = HostConfig::load_from(&path).unwrap();
        assert_eq!(loaded.bus.pool_capacity, 8);
        assert_eq!(loaded.plugins.directory, Some(PathBuf::from("/opt/addins")));
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let loaded = HostConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.bus.request_timeout_ms, 5_000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[bus]\nrequest_timeout_ms = 100\n").unwrap();

        let loaded = HostConfig::load_from(&path).unwrap();
        assert_eq!(loaded.bus.request_timeout_ms, 100);
        assert_eq!(loaded.bus.pool_capacity, 64);
        assert_eq!(loaded.lifecycle.operation_timeout_secs, 30);
    }

    #[test]
    fn test_list_contains_every_key() {
        let config = HostConfig::default();
        let listed = config.list().unwrap();
        assert_eq!(listed.len(), 8);
        assert!(listed.iter().any(|(k, _)| k == "plugins.signature_scheme"));
    }
}
