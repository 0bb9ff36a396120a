use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadAddress(String),
    NotInRange(String),
    MissingValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadAddress(e) => write!(f, "Address formatting error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::MissingValue(e) => write!(f, "Missing value: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ConnectionFailed,
    WriteFailed,
    ReadFailed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed => write!(f, "Storage connection failed"),
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Failures reported by the remote sandbox provider.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// The sandbox, file or PTY does not exist on the provider side.
    NotFound(String),
    /// The remote operation exceeded its bound.
    Timeout(String),
    /// The PTY process no longer accepts input.
    PtyGone(String),
    /// The provider answered with an unexpected status or payload.
    Upstream(String),
    /// The request never reached the provider.
    Transport(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::NotFound(e) => write!(f, "Sandbox resource not found: {}", e),
            SandboxError::Timeout(e) => write!(f, "Sandbox operation timed out: {}", e),
            SandboxError::PtyGone(e) => write!(f, "Sandbox PTY unavailable: {}", e),
            SandboxError::Upstream(e) => write!(f, "Sandbox provider error: {}", e),
            SandboxError::Transport(e) => write!(f, "Sandbox transport error: {}", e),
        }
    }
}

impl std::error::Error for SandboxError {}

#[derive(Debug)]
pub enum ProvisionError {
    CreationFailed(SandboxError),
    InstallFailed(String),
    FileWriteFailed(String, SandboxError),
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionError::CreationFailed(e) => write!(f, "Sandbox creation failed: {}", e),
            ProvisionError::InstallFailed(e) => write!(f, "Sandbox install step failed: {}", e),
            ProvisionError::FileWriteFailed(path, e) => {
                write!(f, "Failed to write {} into sandbox: {}", path, e)
            }
        }
    }
}

impl std::error::Error for ProvisionError {}

#[derive(Debug)]
pub enum CaptureError {
    WatcherFailed(SandboxError),
    PtyFailed(SandboxError),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::WatcherFailed(e) => write!(f, "File watcher attach error: {}", e),
            CaptureError::PtyFailed(e) => write!(f, "PTY attach error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Client-visible failures of session operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// No session, or no sandbox reachable for it.
    NotFound(String),
    /// A cached handle rejected an operation.
    StaleHandle(String),
    Timeout(String),
    /// Reconnect failed, or the retry after a forced reconnect failed again.
    Unavailable(String),
    UpstreamFailure(String),
    InvalidRequest(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(e) => write!(f, "{}", e),
            SessionError::StaleHandle(e) => write!(f, "Stale sandbox handle: {}", e),
            SessionError::Timeout(e) => write!(f, "Operation timed out: {}", e),
            SessionError::Unavailable(e) => write!(f, "{}", e),
            SessionError::UpstreamFailure(e) => write!(f, "Upstream failure: {}", e),
            SessionError::InvalidRequest(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::UpstreamFailure(err.to_string())
    }
}

impl From<SandboxError> for SessionError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(e) => SessionError::NotFound(e),
            SandboxError::Timeout(e) => SessionError::Timeout(e),
            SandboxError::PtyGone(e) => SessionError::StaleHandle(e),
            other => SessionError::UpstreamFailure(other.to_string()),
        }
    }
}

impl From<ProvisionError> for SessionError {
    fn from(err: ProvisionError) -> Self {
        SessionError::UpstreamFailure(err.to_string())
    }
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        SessionError::UpstreamFailure(err.to_string())
    }
}

/// Failures handing a finished session to the evaluation collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationError {
    Transport(String),
    Rejected(u16),
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationError::Transport(e) => write!(f, "Notification transport error: {}", e),
            NotificationError::Rejected(status) => {
                write!(f, "Notification rejected with status {}", status)
            }
        }
    }
}

impl std::error::Error for NotificationError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}
