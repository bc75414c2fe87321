//! frame-echo: a concurrent length-prefixed request/response TCP server.
//!
//! Features:
//! - Length-prefixed framing (`u32` big-endian length, then payload)
//! - One task per connection, strict request/response ordering
//! - Registry of live connections
//! - Graceful shutdown: stop accepting, drain within a deadline, force-close
//! - Configuration via CLI arguments or TOML file

pub mod apps;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod protocol;
pub mod server;
