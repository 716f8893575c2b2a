//! # querysync - query cache and mutation coordinator
//!
//! querysync keeps a locally cached read-model consistent with remote writes,
//! the way SWR or TanStack Query do for web applications, without tying itself
//! to any UI framework or transport.
//!
//! ## Components
//!
//! - [`QueryCache`]: keyed store of read results. Reads are triggered with
//!   [`ensure_fresh`](QueryCache::ensure_fresh); entries can be invalidated and
//!   in-flight reads cancelled per key.
//! - [`MutationCoordinator`]: runs one [`Mutation`] at a time. It cancels reads
//!   that the mutation is about to make obsolete, dispatches the remote call
//!   through a [`Gateway`], invalidates the affected keys on success and
//!   surfaces the error on failure.
//! - [`Subscription`]: listeners on a key or on a coordinator receive every
//!   committed transition, starting with the current state.
//!
//! ## Consistency
//!
//! Each cache entry carries a fetch generation. Fetch starts and cancellations
//! move it forward, and a fetch only lands if its generation is still current,
//! so the cache never regresses to data older than a newer fetch or a
//! cancellation. A failed mutation never invalidates anything.
//!
//! ## Example
//!
//! ```rust
//! use futures::FutureExt;
//! use querysync::prelude::*;
//!
//! struct CancelFriendRequest;
//!
//! impl Mutation for CancelFriendRequest {
//!     type Input = u64;
//!     type Output = ();
//!     const NAME: &'static str = "cancelFriendRequest";
//!
//!     fn affected_keys(&self, _: &u64) -> Vec<QueryKey> {
//!         vec![QueryKey::new("friendRequestsSent")]
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = QueryCache::new();
//! cache.set_data("friendRequestsSent", vec![7_u64, 8]);
//!
//! let gateway = |_: &'static str, _: u64| async { Ok::<_, GatewayError>(()) }.boxed();
//! let cancel = MutationCoordinator::new(cache.clone(), gateway, CancelFriendRequest);
//!
//! cancel.run(7).await.unwrap();
//!
//! // The list is still readable but will be refetched on next use.
//! let sent = cache.get::<Vec<u64>>("friendRequestsSent");
//! assert!(sent.is_stale);
//! assert_eq!(sent.data(), Some(&vec![7, 8]));
//! # }
//! ```

pub mod cache;
mod config;
mod error;
pub mod gateway;
mod key;
pub mod mutation;
pub mod prelude;
mod sink;
mod subscriber;

pub use cache::{EntrySnapshot, FetchHandle, FetchOutcome, QueryCache, QueryEntry, QueryStatus};
pub use config::CacheConfig;
pub use error::{GatewayError, QueryError};
pub use gateway::Gateway;
pub use key::QueryKey;
pub use mutation::{Mutation, MutationCoordinator, MutationState, MutationStatus};
pub use sink::{ErrorSink, ErrorSlot};
pub use subscriber::Subscription;
