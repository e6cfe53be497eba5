//! Rule validation.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

use convoy_core::config::SecurityConfig;
use convoy_platform::PlatformError;
use convoy_state::{Direction, Protocol, RuleSource, SecurityRule, StateError};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy violation: rule {index} admits application port {port} from {cidr}")]
    Violation { index: usize, port: u16, cidr: String },

    #[error("invalid rule {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("firewall update failed: {0}")]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Parse a CIDR block. A bare address is a single-host block.
fn parse_cidr(cidr: &str) -> Option<IpNet> {
    let cidr = cidr.trim();
    cidr.parse::<IpNet>()
        .ok()
        .or_else(|| cidr.parse::<IpAddr>().ok().map(IpNet::from))
}

/// Check a rule set against the application port.
///
/// Every rule is checked; the first problem found is returned.
pub fn validate_rules(rules: &[SecurityRule], app_port: u16) -> Result<(), PolicyError> {
    for (index, rule) in rules.iter().enumerate() {
        if rule.protocol != Protocol::All && rule.ports.from > rule.ports.to {
            return Err(PolicyError::Invalid {
                index,
                reason: format!("port range {}-{} is reversed", rule.ports.from, rule.ports.to),
            });
        }

        match &rule.source {
            RuleSource::PeerGroup(group) if group.trim().is_empty() => {
                return Err(PolicyError::Invalid {
                    index,
                    reason: "empty peer group".to_string(),
                });
            }
            RuleSource::PeerGroup(_) => {}
            RuleSource::Cidr(cidr) => {
                let Some(net) = parse_cidr(cidr) else {
                    return Err(PolicyError::Invalid {
                        index,
                        reason: format!("malformed CIDR: {cidr}"),
                    });
                };
                if rule.direction == Direction::Ingress
                    && net.prefix_len() == 0
                    && rule.covers_port(app_port)
                {
                    return Err(PolicyError::Violation {
                        index,
                        port: app_port,
                        cidr: cidr.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Convert the `[[security.rules]]` section into rules.
pub fn rules_from_config(cfg: &SecurityConfig) -> Result<Vec<SecurityRule>, PolicyError> {
    cfg.rules
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            SecurityRule::try_from(rule).map_err(|e| PolicyError::Invalid {
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}
