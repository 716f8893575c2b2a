//! Prelude module for convenient imports.
//!
//! ```
//! use querysync::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryCache`], [`QueryEntry`], [`QueryKey`], [`FetchOutcome`] - Reading and caching
//! - [`Mutation`], [`MutationCoordinator`], [`MutationState`] - Writing
//! - [`Gateway`] - The remote call boundary
//! - [`ErrorSink`], [`ErrorSlot`] - Surfacing mutation errors
//! - [`QueryError`], [`GatewayError`] - Error types

pub use crate::cache::{FetchOutcome, QueryCache, QueryEntry, QueryStatus};
pub use crate::error::{GatewayError, QueryError};
pub use crate::gateway::Gateway;
pub use crate::key::QueryKey;
pub use crate::mutation::{Mutation, MutationCoordinator, MutationState, MutationStatus};
pub use crate::sink::{ErrorSink, ErrorSlot};
pub use crate::subscriber::Subscription;
