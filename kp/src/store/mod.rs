//! Shared coordination store client
//!
//! A single actor owns the [`keystore::KvStore`] backend and serves
//! commands sent over a channel, giving cheap cloneable async handles to
//! every component of a replica.

mod client;
mod messages;

pub use client::StoreClient;
pub use messages::{StoreCommand, StoreError, StoreResult};
