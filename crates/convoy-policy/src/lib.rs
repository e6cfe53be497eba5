//! convoy-policy — network/security policy enforcer.
//!
//! A proposed rule set is validated against the service's application
//! port before anything is applied. Ingress that covers the application
//! port must come from a peer group (the load balancer); a rule admitting
//! it from an unrestricted CIDR (`0.0.0.0/0`, `::/0`) is a
//! [`PolicyError::Violation`].
//!
//! Valid sets replace the previous set as a whole: the firewall is updated
//! first and the new [`RuleSet`](convoy_state::RuleSet) is committed in one
//! store transaction afterwards. When either step fails the previous rules
//! stay active.

pub mod enforcer;
pub mod validate;

pub use enforcer::PolicyEnforcer;
pub use validate::{PolicyError, rules_from_config, validate_rules};
