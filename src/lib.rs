pub mod code_execution;
pub mod configuration;
pub mod controller;
pub mod data_capture;
pub mod error_handling;
pub mod notification;
pub mod sandbox;
pub mod session_management;
pub mod storage;
pub mod terminal_relay;
pub mod web_interface;

#[cfg(test)]
mod test_support;
