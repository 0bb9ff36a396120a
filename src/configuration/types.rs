use serde::Deserialize;
use std::path::PathBuf;

/// HTTP listener settings.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("127.0.0.1"),
            port: 8080,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("atrium.sqlite3"),
        }
    }
}

/// Remote sandbox provider and provisioning settings.
///
/// Secrets are never part of the file: `api_key_env` and `assistant_key_env`
/// name the environment variables holding them.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub provider_url: String,
    pub api_key_env: String,
    pub assistant_key_env: String,
    pub template: String,
    pub lifetime_secs: u64,
    pub project_root: String,
    pub tooling_install_command: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider_url: String::from("http://127.0.0.1:8090"),
            api_key_env: String::from("ATRIUM_SANDBOX_API_KEY"),
            assistant_key_env: String::from("CANDIDATE_ANTHROPIC_KEY"),
            template: String::from("base"),
            lifetime_secs: 3600,
            project_root: String::from("/home/user/project"),
            tooling_install_command: String::from("npm install -g @anthropic-ai/claude-code"),
        }
    }
}

/// Per-operation bounds, in seconds.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub list_files_secs: u64,
    pub run_secs: u64,
    pub pre_submit_test_secs: u64,
    pub submit_test_secs: u64,
    pub install_secs: u64,
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            list_files_secs: 5,
            run_secs: 30,
            pre_submit_test_secs: 60,
            submit_test_secs: 30,
            install_secs: 120,
            probe_secs: 5,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Quiescence window before buffered terminal output is written as one event.
    pub debounce_ms: u64,
    pub pty_cols: u16,
    pub pty_rows: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            pty_cols: 120,
            pty_rows: 40,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Wait between the initial resize and the broadcast subscription.
    pub resize_settle_ms: u64,
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            resize_settle_ms: 150,
            broadcast_capacity: 1024,
        }
    }
}

/// Hand-off to the external evaluation/summary collaborator.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Base URL; `POST {notify_url}/sessions/{id}/end` is issued on completion.
    pub notify_url: Option<String>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            notify_url: None,
            max_attempts: 5,
            initial_backoff_ms: 500,
        }
    }
}
