//! Chatmux - multiplexes chat users across a pool of upstream credentials
//!
//! This crate provides a daemon that keeps one conversation per user and
//! model tier, serializes upstream calls per credential, and recovers from
//! token expiry and throttling behind a stable error taxonomy.

pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod testing;
pub mod upstream;

pub use error::ChatmuxError;
