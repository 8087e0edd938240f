//! Core configuration.
//!
//! Defaults work out of the box; a `redcell.toml` under the redcell home
//! overlays them. Only knobs the core itself consults live here: transport
//! credentials, scanner wiring and UI settings belong to their own layers.

use std::io::Error as IoError;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;

pub const CONFIG_FILE: &str = "redcell.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engagement: EngagementConfig,
    pub archive: ArchiveConfig,
    pub model: ModelConfig,
    pub stream: StreamConfig,
    pub experimental: ExperimentalConfig,
}

/// Where the live engagement directories go:
/// `<base_dir>/<prefix>-session-<root>/`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    pub base_dir: PathBuf,
    pub prefix: String,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
            prefix: "redcell".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Defaults to `~/.engagement/sessions` when unset.
    pub base_dir: Option<PathBuf>,
}

impl ArchiveConfig {
    pub fn resolve_base(&self) -> PathBuf {
        if let Some(base) = &self.base_dir {
            return base.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".engagement")
            .join("sessions")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Context window in tokens; `0` disables the compaction check.
    pub context_window: u64,
    /// Headroom kept free before compaction is demanded.
    pub compaction_margin: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider: None,
            context_window: 200_000,
            compaction_margin: 16_384,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub max_retries: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExperimentalConfig {
    /// When set, a rejected permission fails only the one tool call instead
    /// of ending the whole turn.
    pub continue_loop_on_deny: bool,
    /// Tools exempt from MCP output post-processing even when the registry
    /// lists them.
    pub primary_tools: Vec<String>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|err| IoError::new(ErrorKind::InvalidData, err.to_string()).into())
    }

    /// `~/.redcell/redcell.toml` when present, defaults otherwise.
    pub fn load() -> Result<Self> {
        let Some(home) = dirs::home_dir() else {
            return Ok(Self::default());
        };
        let path = home.join(".redcell").join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }
}
