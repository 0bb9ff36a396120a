//! Terminal relay between client emulators and sandbox PTYs.
//!
//! - `broadcast_hub`: per-session, no-replay fan-out of terminal output.
//! - `relay`: input forwarding with one-shot reconnect, resize and the clean attach sequence.

pub mod broadcast_hub;
pub mod relay;

pub use broadcast_hub::{terminal_topic, BroadcastHub};
pub use relay::{TerminalRelay, TerminalSize, TerminalStream, CLEAR_SCREEN};
