//! convoy-gate — vulnerability gate.
//!
//! Two halves with different contracts:
//!
//! - [`VulnerabilityGate::scan`] talks to the scanner. Transient failures
//!   (unreachable scanner, per-attempt timeout) are retried with backoff
//!   and surface as [`GateError::ScanUnavailable`] once attempts run out.
//! - [`evaluate`] is pure: the same report and policy always give the same
//!   decision, and nothing is fetched while deciding.
//!
//! A report passes iff no counted finding has severity ≥ the threshold.
//! CVE ids on the policy's ignore list are not counted.

pub mod evaluate;
pub mod scan;

pub use evaluate::{GateDecision, GatePolicy, evaluate};
pub use scan::{GateError, VulnerabilityGate};
