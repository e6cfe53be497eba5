//! convoy-autoscale — target-tracking autoscaling.
//!
//! An independent periodic loop. Each tick reads the latest metric sample
//! for a service and compares it to the policy's target value. The only
//! output is a new `ServiceSpec.desired_count`, written through the state
//! store's single-writer update; the rollout controller picks it up like
//! any other spec change.
//!
//! # Scaling Algorithm
//!
//! ```text
//! ratio    = observed / target
//! if |ratio - 1| <= dead_band:  NoChange
//! proposed = ceil(desired × ratio)
//! step     = min(|proposed - desired|, max_step)
//! next     = clamp(desired ± step, min_capacity, max_capacity)
//! ```
//!
//! A cooldown after every action suppresses further actions in either
//! direction. A desired count found outside `[min, max]` is clamped back
//! regardless of cooldown.

pub mod metrics;
pub mod scaler;

pub use metrics::{MetricSource, StoreMetricSource, SyntheticFeed};
pub use scaler::{Autoscaler, ScaleDecision, decide};
