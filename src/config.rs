//! Agent configuration
//!
//! All configuration is consumed once at startup. Every section has
//! defaults so the agent can run with no config file at all.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: IdentityConfig,
    pub connection: ConnectionConfig,
    pub executor: ExecutorConfig,
    pub ota: OtaConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

/// Agent identity as declared in the registration message
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub agent_id: String,
    /// Capabilities declared to the operator on registration
    pub capabilities: Vec<String>,
    /// Version of the currently running firmware
    pub firmware_version: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            agent_id: "edge-001".into(),
            capabilities: vec![
                "shell".into(),
                "script".into(),
                "python".into(),
                "file_read".into(),
                "file_write".into(),
                "service".into(),
                "gpio".into(),
                "ota".into(),
            ],
            firmware_version: "0.1.0".into(),
        }
    }
}

/// Configuration for the connection manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Operator address (host:port)
    pub operator_addr: String,
    /// Reconnection delay (initial) in milliseconds
    pub reconnect_base_ms: u64,
    /// Maximum reconnection delay in milliseconds
    pub reconnect_cap_ms: u64,
    /// Maximum connect attempts before giving up; 0 = unlimited
    pub max_attempts: u32,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Keep-alive deadline: a link with no inbound traffic for this long
    /// is considered dead (should be > heartbeat interval)
    pub keepalive_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            operator_addr: "127.0.0.1:8080".into(),
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 60_000,
            max_attempts: 0,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            keepalive_timeout_ms: 15_000,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

/// Configuration for the task executor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of tasks executing simultaneously
    pub max_concurrent: usize,
    /// Default per-task timeout in milliseconds
    pub default_timeout_ms: u64,
    /// If non-empty, only listed actions may run
    pub allowlist: Vec<String>,
    /// Listed actions are denied regardless of the allowlist
    pub blocklist: Vec<String>,
    /// Maximum bytes read back from file_read tasks
    pub max_file_bytes: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_timeout_ms: 30_000,
            allowlist: Vec::new(),
            blocklist: vec!["rm".into(), "mkfs".into(), "dd".into(), "shutdown".into()],
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// Configuration for the update manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Manifest fetch attempts before the job fails
    pub manifest_attempts: u32,
    /// Deadline for the operator's manifest response, per attempt, in
    /// milliseconds
    pub manifest_timeout_ms: u64,
    /// Image download attempts before the job fails
    pub download_attempts: u32,
    /// Base retry delay in milliseconds (doubles per attempt)
    pub retry_base_ms: u64,
    /// Interval for scheduler-driven update checks; 0 = operator-driven only
    pub check_interval_ms: u64,
    /// Directory where images are staged; empty = system temp dir
    pub download_dir: PathBuf,
    /// Maintenance window as UTC hours [start, end); equal values = always open
    pub window_start_hour: u8,
    pub window_end_hour: u8,
    /// Delay before re-checking a closed maintenance window, in milliseconds
    pub window_recheck_ms: u64,
    /// Command run to apply a verified image; empty = simulated flash
    pub flash_command: Vec<String>,
    /// Command run to reboot after a successful flash; empty = skip
    pub reboot_command: Vec<String>,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            manifest_attempts: 3,
            manifest_timeout_ms: 10_000,
            download_attempts: 3,
            retry_base_ms: 2_000,
            check_interval_ms: 0,
            download_dir: PathBuf::new(),
            window_start_hour: 0,
            window_end_hour: 0,
            window_recheck_ms: 60_000,
            flash_command: Vec::new(),
            reboot_command: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.agent_id, "edge-001");
        assert_eq!(config.connection.reconnect_cap_ms, 60_000);
        assert_eq!(config.executor.max_concurrent, 4);
        assert!(config.executor.allowlist.is_empty());
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[agent]
agent_id = "edge-042"

[executor]
max_concurrent = 2
blocklist = ["reboot"]
"#
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.agent.agent_id, "edge-042");
        assert_eq!(config.executor.max_concurrent, 2);
        assert_eq!(config.executor.blocklist, vec!["reboot".to_string()]);
        // Untouched sections keep defaults
        assert_eq!(config.connection.operator_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AgentConfig::load(Path::new("/nonexistent/outpost.toml")).is_err());
    }
}
