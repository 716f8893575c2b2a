//! The remote call boundary.
//!
//! The cache and the coordinator never talk to a transport directly. Mutations go
//! through a [`Gateway`], which performs exactly one named remote operation per
//! call. Ordinary failures (network, validation on the remote side, timeouts)
//! come back as [`GatewayError::Transport`]; a transport that can no longer be
//! used reports [`GatewayError::Fatal`].
//!
//! Any closure with the right shape is a gateway:
//!
//! ```rust
//! use futures::FutureExt;
//! use querysync::{Gateway, GatewayError};
//!
//! let gateway = |operation: &'static str, friend_request_id: u64| {
//!     async move {
//!         if friend_request_id == 0 {
//!             return Err(GatewayError::Transport("NOT_FOUND".to_string()));
//!         }
//!         Ok(format!("{operation}({friend_request_id})"))
//!     }
//!     .boxed()
//! };
//!
//! # fn assert_gateway(_: &impl Gateway<u64, String>) {}
//! assert_gateway(&gateway);
//! ```

use futures::future::BoxFuture;

use crate::error::GatewayError;

/// Performs one named remote operation.
///
/// Implementations must not retry implicitly; timeouts are reported as
/// [`GatewayError::Transport`].
pub trait Gateway<I, O>: Send + Sync {
    /// Calls `operation` with `input`.
    fn call(&self, operation: &'static str, input: I) -> BoxFuture<'static, Result<O, GatewayError>>;
}

impl<I, O, F> Gateway<I, O> for F
where
    F: Fn(&'static str, I) -> BoxFuture<'static, Result<O, GatewayError>> + Send + Sync,
{
    fn call(&self, operation: &'static str, input: I) -> BoxFuture<'static, Result<O, GatewayError>> {
        self(operation, input)
    }
}
