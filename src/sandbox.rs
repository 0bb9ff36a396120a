//! Remote sandbox subsystem.
//!
//! This module exposes the seam between the session core and the remote
//! sandbox provider, along with the provisioning sequence that turns a blank
//! sandbox into a ready candidate workspace.
//!
//! Re-exports:
//! - [`SandboxProvider`], [`Sandbox`]: provider-agnostic traits.
//! - [`RemoteSandboxProvider`]: HTTP/WebSocket client for the hosted provider.
//! - [`SandboxProvisioner`]: creates and seeds a sandbox for a challenge.

pub mod provider;
pub mod project_path;
pub mod provisioner;
pub mod remote_provider;
pub mod test_files;

pub use provider::{
    CommandOutput, CreateOptions, FileEvent, PtyOptions, PtyProcess, Sandbox, SandboxProvider,
};
pub use provisioner::{ProvisionedSandbox, SandboxProvisioner};
pub use remote_provider::RemoteSandboxProvider;
