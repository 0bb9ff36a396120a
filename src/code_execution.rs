//! Running candidate code and the hidden test suite.
//!
//! - `command_detection`: chooses run and test commands from the challenge files.
//! - `command_runner`: executes them in the sandbox, gates submission and
//!   completes the session on submit.

pub mod command_detection;
pub mod command_runner;

pub use command_runner::{CommandRunner, RunOutcome, SubmitOutcome, TestTimeoutPolicy};
