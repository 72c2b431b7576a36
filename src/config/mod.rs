//! Runtime configuration.
//!
//! [`RuntimeConfig`] carries every tunable with its default; the
//! file-backed [`SettingsFile`] is the TOML-friendly subset users
//! actually edit, loaded from the platform config directory.

use crate::networking::circuit::CircuitConfig;
use crate::world::avatar::AvatarConfig;
use crate::world::chat::ChatConfig;
use crate::world::lifecycle::LifecycleConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.toml";

/// Full runtime parameterization, defaults per the protocol notes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub display_name: String,
    pub circuit: CircuitConfig,
    pub avatar: AvatarConfig,
    pub lifecycle: LifecycleConfig,
    pub chat: ChatConfig,
    pub handshake_timeout: Duration,
    pub cleanup_interval: Duration,
    pub orphan_check_interval: Duration,
    pub memory_warn_bytes: u64,
    pub memory_critical_bytes: u64,
    /// Distance beyond which emergency cleanup culls first.
    pub cull_distance: f32,
    /// Object-count target for emergency culls.
    pub memory_capacity_target: usize,
    /// Radius of the avatar collision broadphase.
    pub collider_broadphase: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            display_name: "Resident".to_string(),
            circuit: CircuitConfig::default(),
            avatar: AvatarConfig::default(),
            lifecycle: LifecycleConfig::default(),
            chat: ChatConfig::default(),
            handshake_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            orphan_check_interval: Duration::from_secs(60),
            memory_warn_bytes: 768 * 1024 * 1024,
            memory_critical_bytes: 896 * 1024 * 1024,
            cull_distance: 100.0,
            memory_capacity_target: 100,
            collider_broadphase: 5.0,
        }
    }
}

/// The subset persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsFile {
    pub display_name: String,
    pub reliable_retry_cap: u8,
    pub reliable_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub chat_history_cap: usize,
    pub bubble_display_secs: u64,
    pub bubble_max_distance: f32,
    pub chat_max_distance: f32,
    pub stale_object_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub orphan_check_interval_secs: u64,
    pub memory_warn_mb: u64,
    pub memory_critical_mb: u64,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for SettingsFile {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            display_name: config.display_name.clone(),
            reliable_retry_cap: config.circuit.retry_cap,
            reliable_timeout_secs: config.circuit.reliable_timeout.as_secs(),
            handshake_timeout_secs: config.handshake_timeout.as_secs(),
            chat_history_cap: config.chat.history_cap,
            bubble_display_secs: config.chat.bubble_display.as_secs(),
            bubble_max_distance: config.chat.bubble_max_distance,
            chat_max_distance: config.chat.chat_max_distance,
            stale_object_timeout_secs: config.lifecycle.stale_timeout.as_secs(),
            cleanup_interval_secs: config.cleanup_interval.as_secs(),
            orphan_check_interval_secs: config.orphan_check_interval.as_secs(),
            memory_warn_mb: config.memory_warn_bytes / (1024 * 1024),
            memory_critical_mb: config.memory_critical_bytes / (1024 * 1024),
        }
    }
}

impl SettingsFile {
    pub fn into_runtime(self) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.display_name = self.display_name;
        config.circuit.retry_cap = self.reliable_retry_cap;
        config.circuit.reliable_timeout = Duration::from_secs(self.reliable_timeout_secs);
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        config.chat.history_cap = self.chat_history_cap;
        config.chat.bubble_display = Duration::from_secs(self.bubble_display_secs);
        config.chat.bubble_max_distance = self.bubble_max_distance;
        config.chat.chat_max_distance = self.chat_max_distance;
        config.lifecycle.stale_timeout = Duration::from_secs(self.stale_object_timeout_secs);
        config.cleanup_interval = Duration::from_secs(self.cleanup_interval_secs);
        config.orphan_check_interval = Duration::from_secs(self.orphan_check_interval_secs);
        config.memory_warn_bytes = self.memory_warn_mb * 1024 * 1024;
        config.memory_critical_bytes = self.memory_critical_mb * 1024 * 1024;
        config
    }
}

fn settings_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "slipstream", "slipstream")
        .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
}

pub fn save_settings(config: &RuntimeConfig) -> std::io::Result<()> {
    if let Some(path) = settings_path() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match toml::to_string_pretty(&SettingsFile::from(config)) {
            Ok(body) => fs::write(path, body)?,
            Err(err) => warn!("settings serialize failed: {}", err),
        }
    }
    Ok(())
}

pub fn load_settings() -> RuntimeConfig {
    if let Some(path) = settings_path() {
        if let Ok(body) = fs::read_to_string(path) {
            match toml::from_str::<SettingsFile>(&body) {
                Ok(file) => return file.into_runtime(),
                Err(err) => warn!("settings parse failed, using defaults: {}", err),
            }
        }
    }
    RuntimeConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_table() {
        let config = RuntimeConfig::default();
        assert_eq!(config.circuit.reliable_timeout, Duration::from_secs(10));
        assert_eq!(config.circuit.retry_cap, 3);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.chat.history_cap, 1000);
        assert_eq!(config.chat.bubble_display, Duration::from_secs(10));
        assert_eq!(config.chat.bubble_max_distance, 50.0);
        assert_eq!(config.chat.chat_max_distance, 100.0);
        assert_eq!(config.lifecycle.stale_timeout, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.orphan_check_interval, Duration::from_secs(60));
        assert_eq!(config.memory_warn_bytes, 768 * 1024 * 1024);
        assert_eq!(config.memory_critical_bytes, 896 * 1024 * 1024);
    }

    #[test]
    fn test_settings_round_trip() {
        let config = RuntimeConfig::default();
        let file = SettingsFile::from(&config);
        let body = toml::to_string_pretty(&file).unwrap();
        let reparsed: SettingsFile = toml::from_str(&body).unwrap();
        let rebuilt = reparsed.into_runtime();
        assert_eq!(rebuilt.display_name, config.display_name);
        assert_eq!(rebuilt.circuit.retry_cap, config.circuit.retry_cap);
        assert_eq!(rebuilt.chat.history_cap, config.chat.history_cap);
    }
}
