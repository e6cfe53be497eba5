//! convoy-registry — registry publisher.
//!
//! Publishing is keyed by digest. A digest that was already published
//! returns the recorded reference without touching the registry, and a
//! digest the registry already holds is not pushed again. Otherwise the
//! image is pushed under its version tag and the `latest` alias.
//!
//! Network errors are retried with exponential backoff up to the policy's
//! attempt limit and then surface as [`PublishError::PushFailed`]. Rejections
//! (auth, quota) are never retried.

pub mod publisher;

pub use publisher::{LATEST_TAG, PublishError, Publisher};
