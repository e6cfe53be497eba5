//! convoyd — assembles the convoy subsystems into one process.
//!
//! [`System::start`] wires, for one service:
//! - State store (redb)
//! - Rollout controller loop
//! - Autoscaler loop
//! - Network policy enforcer
//! - Pipeline orchestrator lane
//! - REST API router
//!
//! External systems are passed in as [`Collaborators`]; the standalone mode
//! uses the in-memory implementations.

pub mod system;

pub use system::{Collaborators, System};
