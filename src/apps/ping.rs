//! Ping application.
//!
//! A minimal health-check service:
//!
//! ```text
//! Request:  PING
//! Response: PONG
//!
//! Request:  PING hello
//! Response: PONG hello
//! ```
//!
//! The command is matched case-insensitively. Any other payload is an
//! error, which closes the connection.

use super::{AppError, Application};
use bytes::{BufMut, Bytes, BytesMut};

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(Bytes),
}

/// Error for payloads that are not a ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl std::fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unknown command: {}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

/// Parse a ping request payload.
pub fn parse(input: &Bytes) -> Result<Command, UnknownCommand> {
    if input.eq_ignore_ascii_case(b"PING") {
        Ok(Command::Ping)
    } else if input.len() > 5 && input[..5].eq_ignore_ascii_case(b"PING ") {
        Ok(Command::PingMsg(input.slice(5..)))
    } else {
        Err(UnknownCommand(input.escape_ascii().to_string()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ping;

impl Application for Ping {
    fn call(&self, request: Bytes) -> Result<Bytes, AppError> {
        match parse(&request)? {
            Command::Ping => Ok(Bytes::from_static(b"PONG")),
            Command::PingMsg(msg) => {
                let mut resp = BytesMut::with_capacity(5 + msg.len());
                resp.put_slice(b"PONG ");
                resp.put_slice(&msg);
                Ok(resp.freeze())
            }
        }
    }
}
