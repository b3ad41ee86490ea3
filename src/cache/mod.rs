//! Portal Query Cache
//!
//! Keeps backend reads keyed by `(endpoint, params)` and shares them between
//! subscribers:
//!
//! - **Coalescing**: concurrent subscribers of one key share a single fetch
//! - **Issue order wins**: only the most recently issued fetch for a key is
//!   committed, whatever order responses arrive in
//! - **Tags**: a mutation declares the tags it invalidates; matching entries
//!   go stale at once and subscribed ones refetch
//! - **Idle eviction**: entries without subscribers are dropped after
//!   `keep_unused_for`
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! keep_unused_for = 60 # seconds
//! ```

mod backend;
mod config;
mod entry;
mod error;
mod keys;
mod mutation;
mod query;
mod registry;
mod store;
mod subscription;

pub use backend::{Backend, BackendError, BackendRequest};
pub use config::QueryCacheConfig;
pub use entry::{EntryInfo, QueryOutcome, QueryState, QueryStatus};
pub use error::QueryError;
pub use keys::{Endpoint, KeyError, Method, Params, RequestKey, Tag};
pub use mutation::{Mutation, MutationRecord, MutationStatus};
pub use query::Query;
pub use store::QueryCache;
pub use subscription::Subscription;
