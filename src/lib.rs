//! Query cache and realtime notification channel for the company portal client.
//!
//! - [`cache`]: deduplicating, tag-invalidated cache of REST reads
//! - [`channel`]: per-user push channel with reconnect backoff
//! - [`portal`]: wiring that keeps both in step with the signed-in user

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod infra;
pub mod portal;
pub(crate) mod util;

pub use portal_sync_types as types;
