// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for logwarden

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the sub-folder of `base_folder` that receives baseline files
pub const BASELINE_DIR_NAME: &str = "Baseline";

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Directories to watch, in order
    #[serde(default)]
    pub watch_folders: Vec<WatchedFolder>,

    /// Routing rules, evaluated in order (first match wins)
    #[serde(default)]
    pub routing_rules: Vec<RuleConfig>,

    /// Base folder; baselines live in `<base>/Baseline`
    #[serde(default)]
    pub base_folder: Option<PathBuf>,

    /// Folders whose files are renamed from recorded baselines.
    /// Relative entries are resolved against `base_folder`.
    #[serde(default)]
    pub compare_folders: Vec<PathBuf>,

    /// Rename journal settings
    #[serde(default)]
    pub history: HistoryConfig,
}

/// A directory under surveillance
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct WatchedFolder {
    pub path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
}

impl WatchedFolder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
        }
    }
}

/// One `pattern -> destination` routing entry as written in the config file
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    pub pattern: String,
    pub destination: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

fn default_history_path() -> PathBuf { PathBuf::from("logwarden_history.jsonl") }

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            watch_folders: vec![WatchedFolder::new("./watch")],
            routing_rules: vec![RuleConfig {
                pattern: r".*\.log$".to_string(),
                destination: PathBuf::from("./routed"),
            }],
            base_folder: Some(PathBuf::from("./data")),
            compare_folders: vec![PathBuf::from("Compare")],
            history: HistoryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::WardenError::Config(format!("Failed to parse config: {}", e)))?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `<base>/Baseline`, if a base folder is configured
    pub fn baseline_folder(&self) -> Option<PathBuf> {
        self.base_folder.as_ref().map(|base| base.join(BASELINE_DIR_NAME))
    }

    /// Compare folders with relative entries resolved against the base folder
    pub fn resolved_compare_folders(&self) -> Vec<PathBuf> {
        self.compare_folders
            .iter()
            .map(|folder| match &self.base_folder {
                Some(base) if folder.is_relative() => base.join(folder),
                _ => folder.clone(),
            })
            .collect()
    }
}
