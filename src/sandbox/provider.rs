//! Provider-agnostic sandbox traits.
//!
//! The session core only ever talks to a remote VM through [`SandboxProvider`]
//! and [`Sandbox`]. A non-zero exit status is a successful [`CommandOutput`],
//! not an error; errors are reserved for transport, timeout and lookup failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error_handling::types::SandboxError;

/// Parameters for creating a fresh sandbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub template: String,
    /// Seconds before the provider reclaims the sandbox on its own.
    pub lifetime_secs: u64,
    pub envs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Stdout and stderr joined, as shown to the candidate.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// A single filesystem change reported by the directory watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Provider event kind, e.g. `create`, `write`, `remove`, `rename`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Path relative to the watched directory.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyOptions<'a> {
    pub cols: u16,
    pub rows: u16,
    pub cwd: &'a str,
}

/// A terminal process running inside a sandbox.
///
/// `output` yields raw byte chunks in emission order and ends when the
/// process exits or the stream to the provider drops.
#[derive(Debug)]
pub struct PtyProcess {
    pub pid: u32,
    pub output: mpsc::Receiver<Bytes>,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, options: CreateOptions) -> Result<Arc<dyn Sandbox>, SandboxError>;

    /// Attaches to an existing sandbox by its persisted identifier.
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn sandbox_id(&self) -> &str;

    /// Runs `cmd` through a shell, failing with `SandboxError::Timeout` once `timeout` elapses.
    async fn run_command(&self, cmd: &str, timeout: Duration)
        -> Result<CommandOutput, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Writes `content`, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    /// Starts a recursive watcher; the receiver closes when the watch ends.
    async fn watch_dir(&self, path: &str) -> Result<mpsc::Receiver<FileEvent>, SandboxError>;

    async fn create_pty(&self, options: PtyOptions<'_>) -> Result<PtyProcess, SandboxError>;

    async fn send_pty_input(&self, pid: u32, data: &[u8]) -> Result<(), SandboxError>;

    async fn resize_pty(&self, pid: u32, cols: u16, rows: u16) -> Result<(), SandboxError>;

    async fn kill(&self) -> Result<(), SandboxError>;
}
