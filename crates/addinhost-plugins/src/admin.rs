//! Administrative surface over a running host
//!
//! Commands are plain serde values so they can arrive from a script file or
//! a remote caller. A failing command yields an unsuccessful
//! [`CommandResult`] rather than an error, so scripts keep going.

use crate::{PluginError, PluginHost, PluginResult, PluginState};
use addinhost_core::config::ConfigStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Summary row for `list_plugins`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub enabled: bool,
    pub errors: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminCommand {
    Start {
        id: String,
    },
    Stop {
        id: String,
    },
    Reload {
        id: String,
    },
    Configure {
        id: String,
        key: String,
        value: Value,
    },
    /// Copy a plugin directory into the plugin root and load it
    Install {
        source: PathBuf,
    },
    Uninstall {
        id: String,
        #[serde(default)]
        purge: bool,
    },
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start { id } => write!(f, "start {id}"),
            Self::Stop { id } => write!(f, "stop {id}"),
            Self::Reload { id } => write!(f, "reload {id}"),
            Self::Configure { id, key, .. } => write!(f, "configure {id}.{key}"),
            Self::Install { source } => write!(f, "install {}", source.display()),
            Self::Uninstall { id, purge: true } => write!(f, "uninstall {id} --purge"),
            Self::Uninstall { id, purge: false } => write!(f, "uninstall {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub is_success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            is_success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            is_success: false,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait PluginAdministrator: Send + Sync {
    fn list_plugins(&self) -> Vec<PluginInfo>;

    async fn enable(&self, id: &str) -> PluginResult<()>;

    async fn disable(&self, id: &str) -> PluginResult<()>;

    /// Settings stored under the plugin's namespace, keys without the prefix
    fn get_configuration(&self, id: &str) -> PluginResult<BTreeMap<String, Value>>;

    fn set_configuration(&self, id: &str, key: &str, value: Value) -> PluginResult<()>;

    async fn execute(&self, command: AdminCommand) -> CommandResult;

    /// Run commands in order; one result per command
    async fn execute_script(&self, commands: Vec<AdminCommand>) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.execute(command).await);
        }
        results
    }
}

#[async_trait]
impl PluginAdministrator for PluginHost {
    fn list_plugins(&self) -> Vec<PluginInfo> {
        self.plugins()
            .into_iter()
            .map(|descriptor| PluginInfo {
                enabled: self.is_enabled(&descriptor.id),
                errors: self.errors(&descriptor.id),
                permissions: self
                    .permissions()
                    .granted(&descriptor.id)
                    .names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                version: descriptor.version_label(),
                state: descriptor.state,
                name: descriptor.name,
                id: descriptor.id,
            })
            .collect()
    }

    async fn enable(&self, id: &str) -> PluginResult<()> {
        self.enable_plugin(id).await
    }

    async fn disable(&self, id: &str) -> PluginResult<()> {
        self.disable_plugin(id).await
    }

    fn get_configuration(&self, id: &str) -> PluginResult<BTreeMap<String, Value>> {
        self.require_known(id)?;
        Ok(self.config_store().entries_with_prefix(id))
    }

    fn set_configuration(&self, id: &str, key: &str, value: Value) -> PluginResult<()> {
        self.require_known(id)?;
        Ok(self
            .config_store()
            .set(&ConfigStore::plugin_key(id, key), value)?)
    }

    async fn execute(&self, command: AdminCommand) -> CommandResult {
        let label = command.to_string();
        let outcome = match command {
            AdminCommand::Start { id } => self
                .start_plugin(&id)
                .await
                .map(|()| format!("Started {id}")),
            AdminCommand::Stop { id } => self
                .stop_plugin(&id)
                .await
                .map(|()| format!("Stopped {id}")),
            AdminCommand::Reload { id } => self
                .reload_plugin(&id)
                .await
                .map(|()| format!("Reloaded {id}")),
            AdminCommand::Configure { id, key, value } => self
                .set_configuration(&id, &key, value)
                .map(|()| format!("Set {}", ConfigStore::plugin_key(&id, &key))),
            AdminCommand::Install { source } => self.install(&source).await,
            AdminCommand::Uninstall { id, purge } => self.uninstall(&id, purge).await,
        };

        match outcome {
            Ok(message) => {
                info!(command = %label, "Admin command succeeded");
                CommandResult::ok(message)
            }
            Err(e) => {
                warn!(command = %label, error = %e, "Admin command failed");
                CommandResult::failed(format!("{label} failed"), e.to_string())
            }
        }
    }
}

impl PluginHost {
    fn require_known(&self, id: &str) -> PluginResult<()> {
        match self.descriptor(id) {
            Some(_) => Ok(()),
            None => Err(PluginError::NotFound(id.to_string())),
        }
    }

    fn plugin_root(&self) -> PluginResult<PathBuf> {
        self.config()
            .plugins
            .plugin_dir()
            .map_err(|e| PluginError::Core(addinhost_core::Error::ConfigError(e.to_string())))
    }

    async fn install(&self, source: &Path) -> PluginResult<String> {
        let metadata = tokio::fs::metadata(source).await?;
        if !metadata.is_dir() {
            return Err(PluginError::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a plugin directory", source.display()),
            )));
        }
        let name = source.file_name().ok_or_else(|| {
            PluginError::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no directory name", source.display()),
            ))
        })?;

        let root = self.plugin_root()?;
        tokio::fs::create_dir_all(&root).await?;
        let destination = root.join(name);
        if tokio::fs::try_exists(&destination).await? {
            return Err(PluginError::IoError(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is already installed", destination.display()),
            )));
        }

        let copied = copy_dir(source, &destination).await?;
        info!(
            source = %source.display(),
            destination = %destination.display(),
            files = copied,
            "Plugin files installed"
        );

        let report = self.discover_and_load(&destination).await?;
        if report.loaded.is_empty() {
            let mut reasons: Vec<String> = report
                .failed
                .iter()
                .map(|(id, errors)| format!("{id}: {}", errors.join("; ")))
                .collect();
            reasons.extend(
                report
                    .discovery_failures
                    .iter()
                    .map(|failure| format!("{}: {}", failure.path.display(), failure.error)),
            );
            if reasons.is_empty() {
                reasons.push("no plugin manifest found".to_string());
            }
            return Err(PluginError::LoadFailed {
                plugin_id: name.to_string_lossy().into_owned(),
                reason: reasons.join("; "),
            });
        }

        Ok(format!("Installed {}", report.loaded.join(", ")))
    }

    async fn uninstall(&self, id: &str, purge: bool) -> PluginResult<String> {
        let descriptor = self
            .descriptor(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let directory = descriptor
            .manifest_path
            .as_deref()
            .and_then(Path::parent)
            .or_else(|| descriptor.plugin_dir())
            .map(Path::to_path_buf);

        let handles = self.unload_plugin(id).await?;
        let mut message = format!("Uninstalled {id}");
        if handles.len() > 1 {
            message.push_str(&format!(" and {} dependent(s)", handles.len() - 1));
        }
        if !purge {
            return Ok(message);
        }

        let removed_keys = self.config_store().remove_prefix(id);
        match directory {
            Some(directory) if self.is_inside_plugin_root(&directory)? => {
                tokio::fs::remove_dir_all(&directory).await?;
                info!(plugin_id = id, directory = %directory.display(), "Plugin files purged");
                message.push_str(&format!(", purged {}", directory.display()));
            }
            Some(directory) => {
                warn!(
                    plugin_id = id,
                    directory = %directory.display(),
                    "Plugin directory lies outside the plugin root, files kept"
                );
            }
            None => {}
        }
        if removed_keys > 0 {
            message.push_str(&format!(", removed {removed_keys} setting(s)"));
        }
        Ok(message)
    }

    /// Strictly below the plugin root; the root itself never qualifies
    fn is_inside_plugin_root(&self, directory: &Path) -> PluginResult<bool> {
        let root = self.plugin_root()?;
        let root = root.canonicalize().unwrap_or(root);
        let directory = match directory.canonicalize() {
            Ok(directory) => directory,
            Err(_) => return Ok(false),
        };
        Ok(directory != root && directory.starts_with(&root))
    }
}

async fn copy_dir(source: &Path, destination: &Path) -> io::Result<u64> {
    let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
    let mut copied = 0;

    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &target).await?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Plugin, PluginContext, StaticActivator};
    use addinhost_core::config::HostConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Quiet;

    #[async_trait]
    impl Plugin for Quiet {
        async fn initialize(&self, _context: PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn write_plugin(dir: &Path, id: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(format!("{id}.so")), b"assembly").unwrap();
        let manifest = format!(
            r#"{{"Addin": {{"Id": "{id}", "Name": "{id}", "Version": "1.0.0",
                "Runtime": {{"Assembly": "{id}.so", "TypeName": "quiet"}},
                "Permissions": {{"Required": ["FileSystem"]}}}}}}"#
        );
        std::fs::write(dir.join(format!("{id}.addin.json")), manifest).unwrap();
    }

    fn host(plugin_root: &Path) -> PluginHost {
        let mut config = HostConfig::default();
        config.plugins.directory = Some(plugin_root.to_path_buf());
        let activator = StaticActivator::new().with("quiet", || Arc::new(Quiet));
        PluginHost::with_activator(config, Arc::new(activator)).unwrap()
    }

    #[test]
    fn test_commands_read_from_json() {
        let script = r#"[
            {"command": "start", "id": "scope"},
            {"command": "configure", "id": "scope", "key": "rate", "value": 250},
            {"command": "uninstall", "id": "scope"}
        ]"#;
        let commands: Vec<AdminCommand> = serde_json::from_str(script).unwrap();
        assert_eq!(commands[0], AdminCommand::Start { id: "scope".into() });
        assert_eq!(commands[1].to_string(), "configure scope.rate");
        assert_eq!(
            commands[2],
            AdminCommand::Uninstall {
                id: "scope".into(),
                purge: false
            }
        );
    }

    #[tokio::test]
    async fn test_install_configure_and_purge() {
        let staging = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        write_plugin(&staging.path().join("scope"), "scope");
        let host = host(root.path());

        let results = host
            .execute_script(vec![
                AdminCommand::Install {
                    source: staging.path().join("scope"),
                },
                AdminCommand::Configure {
                    id: "scope".into(),
                    key: "rate".into(),
                    value: Value::from(250),
                },
            ])
            .await;
        assert!(results.iter().all(|r| r.is_success), "{results:?}");
        assert!(root.path().join("scope").join("scope.addin.json").exists());

        let info = host.list_plugins();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].state, PluginState::Running);
        assert_eq!(info[0].permissions, vec!["FileSystem"]);
        assert_eq!(
            host.get_configuration("scope").unwrap()["rate"],
            Value::from(250)
        );

        let result = host
            .execute(AdminCommand::Uninstall {
                id: "scope".into(),
                purge: true,
            })
            .await;
        assert!(result.is_success, "{result:?}");
        assert!(!root.path().join("scope").exists());
        assert!(host.list_plugins().is_empty());
        assert!(host.config_store().is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_script() {
        let root = TempDir::new().unwrap();
        let host = host(root.path());

        let results = host
            .execute_script(vec![
                AdminCommand::Stop {
                    id: "ghost".into(),
                },
                AdminCommand::Install {
                    source: root.path().join("missing"),
                },
            ])
            .await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].is_success);
        assert!(results[0].error.as_deref().unwrap().contains("ghost"));
        assert!(!results[1].is_success);
    }

    #[tokio::test]
    async fn test_purge_keeps_files_outside_plugin_root() {
        let outside = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        write_plugin(outside.path(), "loose");
        let host = host(root.path());

        host.load_plugin_from_path(&outside.path().join("loose.addin.json"))
            .await
            .unwrap();
        let result = host
            .execute(AdminCommand::Uninstall {
                id: "loose".into(),
                purge: true,
            })
            .await;
        assert!(result.is_success);
        assert!(outside.path().join("loose.so").exists());
    }

    #[test]
    fn test_configuration_requires_known_plugin() {
        let root = TempDir::new().unwrap();
        let host = host(root.path());
        assert!(matches!(
            host.set_configuration("ghost", "k", Value::Null),
            Err(PluginError::NotFound(_))
        ));
    }
}
