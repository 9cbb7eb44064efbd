use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::EngineSettings;

/// Overrides `workspace` from the file.
pub const WORKSPACE_ENV: &str = "QBSYNC_WORKSPACE";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
  /// Source realm the engine syncs.
  #[serde(default = "default_workspace")]
  pub workspace: String,
  /// Types used when a command does not name any.
  #[serde(default)]
  pub target_types: Vec<String>,
  /// Field id that receives attachment lists
  #[serde(default = "default_attachable_field")]
  pub attachable_field: String,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default = "default_identity_ttl")]
  pub identity_ttl_secs: u64,
  #[serde(default = "default_sweep_interval")]
  pub sweep_interval_secs: u64,
  /// Margin subtracted from the earliest webhook change
  #[serde(default = "default_lookback")]
  pub lookback_secs: u64,
  pub request_timeout_secs: Option<u64>,
}

fn default_workspace() -> String {
  "default".to_string()
}

fn default_attachable_field() -> String {
  "attachments".to_string()
}

fn default_page_size() -> u32 {
  1000
}

fn default_identity_ttl() -> u64 {
  24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
  300
}

fn default_lookback() -> u64 {
  60
}

impl Default for Config {
  fn default() -> Self {
    Self {
      workspace: default_workspace(),
      target_types: Vec::new(),
      attachable_field: default_attachable_field(),
      page_size: default_page_size(),
      identity_ttl_secs: default_identity_ttl(),
      sweep_interval_secs: default_sweep_interval(),
      lookback_secs: default_lookback(),
      request_timeout_secs: None,
    }
  }
}

impl Config {
  /// Reads the explicit path, else the first of `./qbsync.yaml` and
  /// `$XDG_CONFIG_HOME/qbsync/config.yaml` that exists, else defaults.
  /// `QBSYNC_WORKSPACE` wins over whatever was loaded.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let config = match explicit_path {
      Some(path) if !path.exists() => {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      Some(path) => Self::read(path)?,
      None => match Self::candidates().into_iter().find(|p| p.exists()) {
        Some(path) => Self::read(&path)?,
        None => Self::default(),
      },
    };

    config
      .with_workspace_override(std::env::var(WORKSPACE_ENV).ok())
      .validated()
  }

  fn candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("qbsync.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("qbsync").join("config.yaml")));
    paths
  }

  fn read(path: &Path) -> Result<Self> {
    let raw = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Cannot read {}: {}", path.display(), e))?;
    serde_yaml::from_str(&raw).map_err(|e| eyre!("Invalid config {}: {}", path.display(), e))
  }

  fn with_workspace_override(self, workspace: Option<String>) -> Self {
    match workspace {
      Some(workspace) if !workspace.is_empty() => Self { workspace, ..self },
      _ => self,
    }
  }

  fn validated(self) -> Result<Self> {
    if self.workspace.is_empty() {
      return Err(eyre!("workspace must not be empty"));
    }
    if self.page_size == 0 {
      return Err(eyre!("page_size must be at least 1"));
    }
    if self.attachable_field.is_empty() {
      return Err(eyre!("attachable_field must not be empty"));
    }
    Ok(self)
  }

  pub fn engine_settings(&self) -> EngineSettings {
    EngineSettings {
      page_size: self.page_size,
      attachable_field: self.attachable_field.clone(),
      lookback: Duration::from_secs(self.lookback_secs),
      request_timeout: self.request_timeout_secs.map(Duration::from_secs),
    }
  }

  pub fn identity_ttl(&self) -> Duration {
    Duration::from_secs(self.identity_ttl_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}
