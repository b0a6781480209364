//! Meridian storage engine.
//!
//! Builds primary and secondary keys over a [`meridian_persist::KvBackend`], executes
//! every write as a compensable transaction, enforces optimistic concurrency on
//! `stateVersion`, serves filtered/paged/ordered listing and publishes one watch event
//! per committed write.

#![forbid(unsafe_code)]

mod engine;
pub mod keys;
pub mod saga;
pub mod score;

pub use engine::{ListQuery, Page, StorageEngine};
pub use saga::{CompensableStep, KvStep, Transaction};
pub use tokio_util::sync::CancellationToken;
