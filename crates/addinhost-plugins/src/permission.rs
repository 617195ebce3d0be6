//! Permission flags and per-plugin grants

use crate::{PluginError, PluginResult};
use bitflags::bitflags;
use dashmap::DashMap;
use tracing::debug;

bitflags! {
    /// Capabilities a plugin may request in its manifest
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permission: u32 {
        const FILE_SYSTEM = 1 << 0;
        const NETWORK = 1 << 1;
        const REGISTRY = 1 << 2;
        const REFLECTION = 1 << 3;
        const NATIVE_CODE = 1 << 4;
        const PROCESS = 1 << 5;
        const USER_INTERFACE = 1 << 6;
        const DATABASE = 1 << 7;
        const ALL = Self::FILE_SYSTEM.bits()
            | Self::NETWORK.bits()
            | Self::REGISTRY.bits()
            | Self::REFLECTION.bits()
            | Self::NATIVE_CODE.bits()
            | Self::PROCESS.bits()
            | Self::USER_INTERFACE.bits()
            | Self::DATABASE.bits();
    }
}

impl Permission {
    pub const NONE: Self = Self::empty();

    /// Parse one permission name. Case and underscores are ignored, so
    /// `FileSystem`, `filesystem` and `FILE_SYSTEM` are equivalent.
    pub fn parse_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();

        let flag = match normalized.as_str() {
            "none" => Self::NONE,
            "filesystem" => Self::FILE_SYSTEM,
            "network" => Self::NETWORK,
            "registry" => Self::REGISTRY,
            "reflection" => Self::REFLECTION,
            "nativecode" => Self::NATIVE_CODE,
            "process" => Self::PROCESS,
            "userinterface" => Self::USER_INTERFACE,
            "database" => Self::DATABASE,
            "all" => Self::ALL,
            _ => return None,
        };
        Some(flag)
    }

    /// Union of every recognised name; unknown names are skipped
    pub fn parse_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().fold(Self::NONE, |acc, name| {
            let name = name.as_ref();
            match Self::parse_name(name) {
                Some(flag) => acc | flag,
                None => {
                    debug!(permission = name, "Ignoring unknown permission");
                    acc
                }
            }
        })
    }

    /// Manifest spelling of each set flag, in bit order
    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::FILE_SYSTEM, "FileSystem"),
            (Self::NETWORK, "Network"),
            (Self::REGISTRY, "Registry"),
            (Self::REFLECTION, "Reflection"),
            (Self::NATIVE_CODE, "NativeCode"),
            (Self::PROCESS, "Process"),
            (Self::USER_INTERFACE, "UserInterface"),
            (Self::DATABASE, "Database"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

/// Granted permissions per plugin id; unknown plugins hold none
#[derive(Debug, Default)]
pub struct PermissionManager {
    grants: DashMap<String, Permission>,
}

impl PermissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, plugin_id: &str, permission: Permission) {
        let mut entry = self.grants.entry(plugin_id.to_string()).or_default();
        *entry |= permission;
        debug!(plugin_id, granted = ?*entry, "Permissions granted");
    }

    pub fn revoke(&self, plugin_id: &str, permission: Permission) {
        if let Some(mut entry) = self.grants.get_mut(plugin_id) {
            entry.remove(permission);
        }
    }

    /// True only when every bit of `permission` is granted
    pub fn has_permission(&self, plugin_id: &str, permission: Permission) -> bool {
        self.granted(plugin_id).contains(permission)
    }

    pub fn check_permission(&self, plugin_id: &str, permission: Permission) -> PluginResult<()> {
        if self.has_permission(plugin_id, permission) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                permission: permission.difference(self.granted(plugin_id)),
            })
        }
    }

    pub fn granted(&self, plugin_id: &str) -> Permission {
        self.grants
            .get(plugin_id)
            .map(|entry| *entry)
            .unwrap_or(Permission::NONE)
    }

    /// Forget every grant for the plugin
    pub fn clear(&self, plugin_id: &str) {
        self.grants.remove(plugin_id);
    }
}
