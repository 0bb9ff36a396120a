//! Activity capture for live sandboxes.
//!
//! - `activity_capture`: attaches the file watcher and terminal pump to a sandbox.
//! - `terminal_log`: debounced durable consumer of terminal output.

pub mod activity_capture;
pub mod terminal_log;

pub use activity_capture::{ActivityCapture, CaptureSettings};
