//! Client settings — where state lives and how long bounded waits last.
//!
//! Loaded from an optional YAML file; every field has a default so a missing
//! or partial file is fine. `MCP_MULTI_SERVER_HOME` overrides the state
//! directory (used by tests and by users running several isolated setups).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable that overrides [`ClientSettings::state_dir`].
pub const STATE_DIR_ENV: &str = "MCP_MULTI_SERVER_HOME";

/// Lifecycle settings for one client invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// Directory holding `servers.json` and `logs/`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Launch local servers on `connect` when they are not running.
    #[serde(default = "default_auto_launch")]
    pub auto_launch: bool,
    /// How long a fresh process must survive to count as launched.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Graceful-termination window before escalating to a forceful kill.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// How long to wait for the process to vanish after a forceful kill.
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    /// Default socket/HTTP connect timeout when the server config has none.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Number of stderr lines attached to launch errors.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

fn default_state_dir() -> PathBuf {
    crate::data_dir()
}
fn default_auto_launch() -> bool {
    true
}
fn default_startup_grace_ms() -> u64 {
    2_000
}
fn default_stop_grace_ms() -> u64 {
    5_000
}
fn default_kill_wait_ms() -> u64 {
    2_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_stderr_tail_lines() -> usize {
    10
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            auto_launch: default_auto_launch(),
            startup_grace_ms: default_startup_grace_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

impl ClientSettings {
    /// Settings rooted at an explicit state directory.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from a YAML file, falling back to defaults.
    ///
    /// A missing file is not an error. A malformed file is logged and
    /// ignored. The state-dir env override is applied last.
    pub fn load_or_default(path: &Path) -> Self {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_yaml_str(&content).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse client settings, using defaults"
                );
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            if !dir.trim().is_empty() {
                settings.state_dir = PathBuf::from(dir);
            }
        }

        settings
    }

    /// Parse settings from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Path of the persisted registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("servers.json")
    }

    /// Directory holding per-launch log files.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = ClientSettings::with_state_dir("/tmp/mms");
        assert!(settings.auto_launch);
        assert_eq!(settings.startup_grace(), Duration::from_secs(2));
        assert_eq!(settings.stop_grace(), Duration::from_secs(5));
        assert_eq!(settings.stderr_tail_lines, 10);
        assert_eq!(settings.registry_path(), PathBuf::from("/tmp/mms/servers.json"));
        assert_eq!(settings.log_dir(), PathBuf::from("/tmp/mms/logs"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "auto_launch: false\nstop_grace_ms: 250\n";
        let settings = ClientSettings::from_yaml_str(yaml).unwrap();
        assert!(!settings.auto_launch);
        assert_eq!(settings.stop_grace_ms, 250);
        assert_eq!(settings.kill_wait_ms, 2_000);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.yaml");
        std::fs::write(&path, "auto_launch: [not, a, bool").unwrap();
        let settings = ClientSettings::load_or_default(&path);
        assert!(settings.auto_launch);
    }

    #[test]
    fn test_missing_file_is_fine() {
        let settings = ClientSettings::load_or_default(Path::new("/nonexistent/settings.yaml"));
        assert_eq!(settings.connect_timeout_ms, 10_000);
    }
}
