//! Echo application.
//!
//! Returns every request payload unchanged. Useful for throughput testing
//! and for verifying data integrity end-to-end.

use super::{AppError, Application};
use bytes::Bytes;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Application for Echo {
    fn call(&self, request: Bytes) -> Result<Bytes, AppError> {
        debug!(len = request.len(), payload = %request.escape_ascii(), "Echo");
        Ok(request)
    }
}
