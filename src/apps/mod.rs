//! Application callbacks.
//!
//! The server is protocol-agnostic above the framing layer: each request
//! payload is handed to an [`Application`] and whatever it returns is sent
//! back as the response payload.
//!
//! ## Built-in Applications
//! - `echo`: returns the request unchanged
//! - `ping`: answers `PING [message]` with `PONG [message]`

pub mod echo;
pub mod ping;

use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

/// Error returned by an application callback.
///
/// A failed callback closes the connection; no partial response is sent.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// Request/response callback invoked once per frame.
///
/// Calls are synchronous and are expected to be short. Long-running work
/// must be offloaded by the implementation, since the callback runs inline
/// on the connection's task.
pub trait Application: Send + Sync + 'static {
    fn call(&self, request: Bytes) -> Result<Bytes, AppError>;
}

impl<F> Application for F
where
    F: Fn(Bytes) -> Result<Bytes, AppError> + Send + Sync + 'static,
{
    fn call(&self, request: Bytes) -> Result<Bytes, AppError> {
        self(request)
    }
}

/// Built-in application selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    #[default]
    Echo,
    Ping,
}

/// Construct the built-in application for `app`.
pub fn build(app: AppType) -> Arc<dyn Application> {
    match app {
        AppType::Echo => Arc::new(echo::Echo),
        AppType::Ping => Arc::new(ping::Ping),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_application() {
        let upper = |req: Bytes| -> Result<Bytes, AppError> {
            Ok(Bytes::from(req.to_ascii_uppercase()))
        };
        assert_eq!(Application::call(&upper, Bytes::from_static(b"abc")).unwrap(), "ABC");
    }

    #[test]
    fn test_build() {
        let echo = build(AppType::Echo);
        assert_eq!(echo.call(Bytes::from_static(b"x")).unwrap(), "x");

        let ping = build(AppType::Ping);
        assert_eq!(ping.call(Bytes::from_static(b"PING")).unwrap(), "PONG");
    }
}
