//! convoy-state — embedded state store for convoy.
//!
//! Backed by [redb](https://docs.rs/redb), holds the long-lived desired and
//! observed records of a service (spec, state, scaling policy, security
//! rules) and the short-lived audit trail of pipeline runs, scan reports,
//! and published references.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! redb allows a single write transaction at a time, which gives every
//! read-modify-write in [`StateStore`] single-writer semantics.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
