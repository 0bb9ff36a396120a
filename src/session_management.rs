//! Session management core module.
//!
//! This module owns the link between durable sessions and live sandboxes:
//! the per-process handle registry, the candidate file surface and the
//! create/end lifecycle of a session's sandbox.

/// Live sandbox connection paired with its capture.
pub mod sandbox_handle;
/// Process-local cache of handles with serialized reconnection.
pub mod session_registry;
/// Candidate-visible file listing, reads and writes.
pub mod project_files;
/// Sandbox teardown and the closing log entry.
pub mod finalizer;
/// Sandbox creation and the end-of-session flow.
pub mod session_manager;

pub use finalizer::SessionFinalizer;
pub use project_files::ProjectFiles;
pub use sandbox_handle::SandboxHandle;
pub use session_manager::{CreatedSandbox, SessionManager};
pub use session_registry::SessionRegistry;
