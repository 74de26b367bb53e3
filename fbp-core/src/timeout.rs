//! Timeout wrappers for port operations.
//!
//! `receive` and `send` accept an optional timeout; on expiry they return
//! [`crate::error::FbpError::Timeout`] without closing the port.
//! No global per-packet deadline is imposed.

use std::future::Future;
use std::time::Duration;

use crate::error::{FbpError, Result};

/// Run `fut` to completion, or return [`FbpError::Timeout`] if `duration` elapses first.
///
/// `duration = None` blocks indefinitely (no timeout), matching the default
/// behavior of a blocking port operation.
pub async fn with_timeout<F, T>(duration: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    match duration {
        None => Ok(fut.await),
        Some(d) => compio::time::timeout(d, fut).await.map_err(|_elapsed| FbpError::Timeout),
    }
}
