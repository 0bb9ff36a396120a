use super::types::*;
use crate::error_handling::types::ConfigError;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Application configuration structure that defines all runtime parameters.
///
/// The configuration is read from a TOML file whose path is given on the command line.
/// Every section and every field is optional; omitted values fall back to their defaults,
/// so an empty file yields a usable development setup.
///
/// # Examples
///
/// ```
/// use atrium::configuration::config::Config;
///
/// let config = Config::from_toml_str("[server]\nport = 9000\n").unwrap();
/// assert_eq!(config.server.port, 9000);
/// assert_eq!(config.capture.debounce_ms, 500);
/// ```
///
/// # Fields Overview
///
/// - `server`: address and port of the HTTP/WebSocket interface
/// - `storage`: location of the SQLite database holding sessions and the activity log
/// - `sandbox`: remote sandbox provider endpoint, template and provisioning commands
/// - `timeouts`: bounds for every blocking call into the sandbox
/// - `capture`: terminal debounce window and initial PTY geometry
/// - `relay`: terminal attach settle delay and broadcast buffer size
/// - `evaluation`: where completed sessions are handed off for summarisation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    pub timeouts: TimeoutConfig,
    pub capture: CaptureConfig,
    pub relay: RelayConfig,
    pub evaluation: EvaluationConfig,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates configuration content.
    pub fn from_toml_str(raw: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .bind_address
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::BadAddress(self.server.bind_address.clone()))?;

        if self.sandbox.provider_url.trim().is_empty() {
            return Err(ConfigError::MissingValue(String::from("sandbox.provider_url")));
        }
        if !self.sandbox.project_root.starts_with('/') {
            return Err(ConfigError::NotInRange(format!(
                "sandbox.project_root must be absolute, got {}",
                self.sandbox.project_root
            )));
        }

        let bounds = [
            ("timeouts.list_files_secs", self.timeouts.list_files_secs),
            ("timeouts.run_secs", self.timeouts.run_secs),
            ("timeouts.pre_submit_test_secs", self.timeouts.pre_submit_test_secs),
            ("timeouts.submit_test_secs", self.timeouts.submit_test_secs),
            ("timeouts.install_secs", self.timeouts.install_secs),
            ("timeouts.probe_secs", self.timeouts.probe_secs),
        ];
        for (name, value) in bounds {
            if value == 0 || value > 600 {
                return Err(ConfigError::NotInRange(format!(
                    "{} must be within 1..=600, got {}",
                    name, value
                )));
            }
        }

        if self.capture.debounce_ms == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "capture.debounce_ms must be greater than 0",
            )));
        }
        if self.capture.pty_cols == 0 || self.capture.pty_rows == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "capture.pty_cols and capture.pty_rows must be greater than 0",
            )));
        }
        if self.relay.broadcast_capacity == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "relay.broadcast_capacity must be greater than 0",
            )));
        }
        if self.evaluation.max_attempts == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "evaluation.max_attempts must be greater than 0",
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .server
            .bind_address
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::BadAddress(self.server.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Provider API key, looked up in the environment variable named by `sandbox.api_key_env`.
    pub fn provider_api_key(&self) -> Option<String> {
        std::env::var(&self.sandbox.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
    }

    /// Key handed to the coding assistant inside each sandbox.
    pub fn assistant_api_key(&self) -> Option<String> {
        std::env::var(&self.sandbox.assistant_key_env)
            .ok()
            .filter(|v| !v.is_empty())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.capture.debounce_ms)
    }

    pub fn resize_settle_delay(&self) -> Duration {
        Duration::from_millis(self.relay.resize_settle_ms)
    }
}

impl TimeoutConfig {
    pub fn list_files(&self) -> Duration {
        Duration::from_secs(self.list_files_secs)
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn pre_submit_tests(&self) -> Duration {
        Duration::from_secs(self.pre_submit_test_secs)
    }

    pub fn submit_tests(&self) -> Duration {
        Duration::from_secs(self.submit_test_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
}
