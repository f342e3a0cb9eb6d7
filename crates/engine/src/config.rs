// SDB - Stored Program Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Configuration for debug sessions
//!
//! Settings are read from `~/.sdb.toml`. A missing file is created with the
//! defaults on first load so users have something to edit.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default bound on the forced step-out loop run while stopping a session.
pub const DEFAULT_ROLL_OUT_TIMEOUT_SECS: u64 = 20;

/// Default bound on automatic resumes while looking for a visible frame.
pub const DEFAULT_MAX_LOCATION_SKIPS: usize = 32;

/// Default number of console lines kept per session.
pub const DEFAULT_CONSOLE_HISTORY: usize = 1000;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Session behaviour
    pub session: SessionConfig,
    /// Session console settings
    pub console: ConsoleConfig,
}

/// Session behaviour settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds the stop sequence keeps stepping out before giving up on unwinding
    pub roll_out_timeout: u64,
    /// Automatic resumes allowed before a stepping command is reported as failed
    pub max_location_skips: usize,
}

/// Session console configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Prefix console lines with the local time
    pub show_timestamps: bool,
    /// Maximum number of history lines to keep
    pub max_history: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self { session: SessionConfig::default(), console: ConsoleConfig::default() }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            roll_out_timeout: DEFAULT_ROLL_OUT_TIMEOUT_SECS,
            max_location_skips: DEFAULT_MAX_LOCATION_SKIPS,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { show_timestamps: true, max_history: DEFAULT_CONSOLE_HISTORY }
    }
}

impl DebuggerConfig {
    /// Get the configuration file path (~/.sdb.toml)
    pub fn config_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| eyre::eyre!("Unable to determine home directory"))?;
        Ok(home.join(".sdb.toml"))
    }

    /// Load configuration from `~/.sdb.toml`, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    /// Load configuration from an explicit path, creating default if it doesn't exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, creating default at {}", path.display());
            let default_config = Self::default();
            default_config.save_to(path)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self =
            toml::from_str(&content).wrap_err("Failed to parse config file as TOML")?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to `~/.sdb.toml`
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path()?)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self).wrap_err("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Roll-out bound as a duration
    pub fn roll_out_timeout(&self) -> Duration {
        Duration::from_secs(self.session.roll_out_timeout)
    }

    /// Set the roll-out bound. Fractions of a second round up, so only a
    /// zero duration disables the roll-out.
    pub fn with_roll_out_timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.session.roll_out_timeout = timeout.as_secs().saturating_add(partial);
        self
    }

    /// Set the automatic resume bound
    pub fn with_max_location_skips(mut self, skips: usize) -> Self {
        self.session.max_location_skips = skips;
        self
    }

    /// Enable or disable console timestamps
    pub fn with_console_timestamps(mut self, show: bool) -> Self {
        self.console.show_timestamps = show;
        self
    }

    /// Set the console history size
    pub fn with_console_history(mut self, max_history: usize) -> Self {
        self.console.max_history = max_history;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DebuggerConfig::default();
        assert_eq!(config.roll_out_timeout(), Duration::from_secs(20));
        assert_eq!(config.session.max_location_skips, DEFAULT_MAX_LOCATION_SKIPS);
        assert!(config.console.show_timestamps);
        assert_eq!(config.console.max_history, DEFAULT_CONSOLE_HISTORY);
    }

    #[test]
    fn test_builders() {
        let config = DebuggerConfig::default()
            .with_roll_out_timeout(Duration::from_secs(5))
            .with_max_location_skips(3)
            .with_console_timestamps(false)
            .with_console_history(10);
        assert_eq!(config.session.roll_out_timeout, 5);
        assert_eq!(config.session.max_location_skips, 3);
        assert!(!config.console.show_timestamps);
        assert_eq!(config.console.max_history, 10);
    }

    #[test]
    fn test_sub_second_roll_out_timeout_rounds_up() {
        let config = DebuggerConfig::default().with_roll_out_timeout(Duration::from_millis(500));
        assert_eq!(config.roll_out_timeout(), Duration::from_secs(1));

        let config = DebuggerConfig::default().with_roll_out_timeout(Duration::from_millis(2001));
        assert_eq!(config.roll_out_timeout(), Duration::from_secs(3));

        let config = DebuggerConfig::default().with_roll_out_timeout(Duration::ZERO);
        assert_eq!(config.roll_out_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DebuggerConfig = toml::from_str("[session]\nmax_location_skips = 4\n").unwrap();
        assert_eq!(config.session.max_location_skips, 4);
        assert_eq!(config.session.roll_out_timeout, DEFAULT_ROLL_OUT_TIMEOUT_SECS);
        assert_eq!(config.console, ConsoleConfig::default());
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdb.toml");

        let config = DebuggerConfig::load_from(&path).unwrap();
        assert_eq!(config, DebuggerConfig::default());
        assert!(path.exists());

        let edited = config.with_max_location_skips(7);
        edited.save_to(&path).unwrap();
        assert_eq!(DebuggerConfig::load_from(&path).unwrap(), edited);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdb.toml");
        fs::write(&path, "session = 3").unwrap();

        let err = DebuggerConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
