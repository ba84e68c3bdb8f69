//! Emulator configuration (ps2vm.toml)
//!
//! Provides the settings consumed by the orchestration core and the CPU
//! collaborator. Every section is optional in the file; missing values take
//! their defaults.

use crate::plugins::PluginId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config file name looked up by the CLI.
pub const CONFIG_FILE_NAME: &str = "ps2vm.toml";

/// Errors that can occur while loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write the config file
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialise TOML
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Complete emulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmConfig {
    /// Command executor and thread hand-off settings
    pub executor: ExecutorConfig,

    /// CPU collaborator settings
    pub cpu: CpuConfig,

    /// Boot behaviour
    pub boot: BootConfig,

    /// GS window behaviour
    pub gs: GsConfig,

    /// Plugin selection
    pub plugins: PluginsConfig,
}

/// Thread hand-off timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Longest a controller waits for the worker to acknowledge a suspend
    pub stop_timeout_ms: u64,

    /// Bounded spin before a resume blocks on an unsettled suspend
    pub resume_spin_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 10_000,
            resume_spin_ms: 2,
        }
    }
}

impl ExecutorConfig {
    /// Stop timeout as a `Duration`.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Resume spin as a `Duration`.
    pub fn resume_spin(&self) -> Duration {
        Duration::from_millis(self.resume_spin_ms)
    }
}

/// CPU settings. Changing them resets the recompiler caches on the next
/// resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CpuConfig {
    /// Use the recompiler instead of the interpreter
    pub recompiler: bool,

    /// Wall-clock length of one virtual frame for the headless CPU
    pub frame_slice_us: u64,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            recompiler: true,
            frame_slice_us: 1_000,
        }
    }
}

/// Boot behaviour on the first resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootConfig {
    /// Skip the BIOS splash
    pub fast_boot: bool,

    /// ELF to boot directly (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elf: Option<PathBuf>,
}

/// GS window behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GsConfig {
    /// Popups fully close the VM instead of pausing it (fullscreen GS
    /// windows would hide the popup)
    pub close_on_popup: bool,
}

/// Plugin selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugins to load
    pub enabled: Vec<PluginId>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: PluginId::ALL.to_vec(),
        }
    }
}

impl VmConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: VmConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.stop_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "executor.stop_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.executor.resume_spin_ms >= self.executor.stop_timeout_ms {
            return Err(ConfigError::Invalid(
                "executor.resume_spin_ms must be below executor.stop_timeout_ms".to_string(),
            ));
        }
        let mut seen = Vec::new();
        for id in &self.plugins.enabled {
            if seen.contains(id) {
                return Err(ConfigError::Invalid(format!(
                    "plugin {} is listed twice in plugins.enabled",
                    id
                )));
            }
            seen.push(*id);
        }
        Ok(())
    }
}
