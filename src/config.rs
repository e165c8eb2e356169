//! Configuration management for the dispatcher
//!
//! This module provides the source-to-destination mappings and the watcher
//! settings loaded from the JSON configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use crate::matcher::normalize_path;

/// Default settle delay before a newly created file is read
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// A single configured rule: files created in `source` are copied to `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMapping {
    /// Directory to watch
    pub source: PathBuf,
    /// Directory to copy into
    pub destination: PathBuf,
}

/// Global configuration for the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Ordered mappings; the first matching mapping wins
    pub threads: Vec<ThreadMapping>,
    /// Watch every subdirectory beneath each source, and directories created later
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    /// Pause before copying a newly created file, in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_recursive() -> bool {
    true
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            threads: Vec::new(),
            recursive: default_recursive(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl ThreadMapping {
    pub fn new<S: Into<PathBuf>, D: Into<PathBuf>>(source: S, destination: D) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

impl DispatcherConfig {
    pub fn new(threads: Vec<ThreadMapping>) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    /// Get settle delay duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Load, override from the environment and validate a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;

        let mut config = Self::from_json(&content)
            .with_context(|| format!("Cannot parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse the configuration without touching the filesystem
    pub fn from_json(content: &str) -> Result<Self> {
        let config = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Override settings with environment variables if present
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override settings from `lookup`, keyed by environment variable name.
    ///
    /// Values that do not parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("DISPATCHER_SETTLE_DELAY_MS") {
            if let Ok(ms) = val.trim().parse::<u64>() {
                self.settle_delay_ms = ms;
            }
        }

        if let Some(val) = lookup("DISPATCHER_RECURSIVE") {
            match val.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => self.recursive = true,
                "false" | "0" => self.recursive = false,
                _ => {}
            }
        }
    }

    /// Check every mapping and rewrite its paths into canonical form
    ///
    /// Both ends of a mapping must exist and be directories. Paths are
    /// canonicalized so the watched paths match the paths reported by events.
    pub fn validate(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            tracing::warn!("Configuration has no threads, nothing will be watched");
        }

        for mapping in &mut self.threads {
            mapping.source = checked_dir(&mapping.source)?;
            mapping.destination = checked_dir(&mapping.destination)?;
        }

        Ok(())
    }
}

fn checked_dir(path: &Path) -> Result<PathBuf> {
    let path = normalize_path(path);
    let metadata = std::fs::metadata(&path)
        .with_context(|| format!("Specified path: {} cannot be accessed", path.display()))?;

    if !metadata.is_dir() {
        bail!("Specified path: {} is not a dir", path.display());
    }

    path.canonicalize()
        .with_context(|| format!("Cannot resolve specified path: {}", path.display()))
}
