use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Every variant except [`QueryError::Fatal`] is recoverable: it is stored in the
/// relevant [`QueryEntry`](crate::QueryEntry) or [`MutationState`](crate::MutationState)
/// and the rest of the cache keeps working.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Input was rejected before dispatch and never reached the gateway.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The remote call failed or timed out.
    #[error("{0}")]
    Transport(String),

    /// A mutation was started while another one was still in flight.
    #[error("Mutation `{operation}` is already in flight")]
    Conflict {
        /// Name of the mutation that was rejected.
        operation: &'static str,
    },

    /// The gateway reported an unrecoverable condition.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl QueryError {
    /// The human readable message, without the variant prefix.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::Transport(msg) | Self::Fatal(msg) => msg.clone(),
            Self::Conflict { .. } => self.to_string(),
        }
    }

    /// Returns `true` for [`QueryError::Fatal`].
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Failure reported by a [`Gateway`](crate::Gateway).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// An ordinary failure: network, timeout, or a rejection by the remote side.
    #[error("{0}")]
    Transport(String),

    /// The transport can no longer be used.
    #[error("{0}")]
    Fatal(String),
}

impl From<GatewayError> for QueryError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transport(msg) => Self::Transport(msg),
            GatewayError::Fatal(msg) => Self::Fatal(msg),
        }
    }
}
