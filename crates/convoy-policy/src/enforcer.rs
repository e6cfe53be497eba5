//! Validated, all-or-nothing application of rule sets.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use convoy_platform::FirewallControl;
use convoy_state::{RuleSet, SecurityRule, StateStore};

use crate::validate::{PolicyError, validate_rules};

pub struct PolicyEnforcer {
    state: StateStore,
    firewall: Arc<dyn FirewallControl>,
    /// Serializes applies so the firewall and the store see sets in the
    /// same order.
    apply_lock: Mutex<()>,
}

impl PolicyEnforcer {
    pub fn new(state: StateStore, firewall: Arc<dyn FirewallControl>) -> Self {
        Self {
            state,
            firewall,
            apply_lock: Mutex::new(()),
        }
    }

    /// Rules currently active for a service.
    pub fn current(&self, service_id: &str) -> Result<Option<RuleSet>, PolicyError> {
        Ok(self.state.get_security_rules(service_id)?)
    }

    /// Validate and apply a complete rule set, replacing the previous one.
    ///
    /// A rejected set leaves the previous rules active on the firewall and
    /// in the store.
    pub async fn apply(
        &self,
        service_id: &str,
        rules: Vec<SecurityRule>,
    ) -> Result<RuleSet, PolicyError> {
        let spec = self
            .state
            .get_service_spec(service_id)?
            .ok_or_else(|| PolicyError::UnknownService(service_id.to_string()))?;

        if let Err(e) = validate_rules(&rules, spec.port) {
            warn!(service = %service_id, error = %e, "rule set rejected");
            return Err(e);
        }

        let _guard = self.apply_lock.lock().await;
        let previous = self.state.get_security_rules(service_id)?;

        self.firewall.replace_rules(service_id, &rules).await?;

        match self.state.replace_security_rules(service_id, rules) {
            Ok(set) => {
                info!(
                    service = %service_id,
                    version = set.version,
                    rules = set.rules.len(),
                    "security rules applied"
                );
                Ok(set)
            }
            Err(e) => {
                // Put the firewall back to what the store still records.
                let restore = previous.map(|p| p.rules).unwrap_or_default();
                if let Err(restore_err) = self.firewall.replace_rules(service_id, &restore).await {
                    warn!(
                        service = %service_id,
                        error = %restore_err,
                        "failed to restore previous security rules"
                    );
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::config::ServiceConfig;
    use convoy_platform::memory::InMemoryPlatform;
    use convoy_state::{Direction, PortRange, Protocol, RuleSource, ServiceSpec};

    fn setup() -> (PolicyEnforcer, Arc<InMemoryPlatform>, StateStore) {
        let state = StateStore::open_in_memory().unwrap();
        let service = ServiceConfig {
            id: "web".to_string(),
            repository: "r/web".to_string(),
            port: 8080,
            cpu_units: 256,
            memory_mb: 512,
            desired_count: 2,
        };
        state
            .put_service_spec(&ServiceSpec::from_config(&service, 100, 200))
            .unwrap();
        let platform = Arc::new(InMemoryPlatform::new());
        let enforcer = PolicyEnforcer::new(state.clone(), platform.clone());
        (enforcer, platform, state)
    }

    fn ingress(port: u16, source: RuleSource) -> SecurityRule {
        SecurityRule {
            direction: Direction::Ingress,
            protocol: Protocol::Tcp,
            ports: PortRange::single(port),
            source,
        }
    }

    fn lb_rules() -> Vec<SecurityRule> {
        vec![ingress(8080, RuleSource::PeerGroup("lb".into()))]
    }

    #[tokio::test]
    async fn valid_set_is_applied_and_versioned() {
        let (enforcer, platform, _) = setup();
        let first = enforcer.apply("web", lb_rules()).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(platform.applied_rules("web"), Some(lb_rules()));

        let mut more = lb_rules();
        more.push(ingress(9090, RuleSource::Cidr("10.0.0.0/8".into())));
        let second = enforcer.apply("web", more.clone()).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(enforcer.current("web").unwrap().unwrap().rules, more);
    }

    #[tokio::test]
    async fn violation_keeps_previous_rules() {
        let (enforcer, platform, _) = setup();
        enforcer.apply("web", lb_rules()).await.unwrap();

        let mut open = lb_rules();
        open.push(ingress(8080, RuleSource::Cidr("0.0.0.0/0".into())));
        let err = enforcer.apply("web", open).await.unwrap_err();
        assert!(matches!(err, PolicyError::Violation { index: 1, .. }));

        assert_eq!(platform.applied_rules("web"), Some(lb_rules()));
        let current = enforcer.current("web").unwrap().unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.rules, lb_rules());
    }

    #[tokio::test]
    async fn firewall_rejection_keeps_previous_rules() {
        let (enforcer, platform, _) = setup();
        enforcer.apply("web", lb_rules()).await.unwrap();
        platform.reject_rules(true);

        let other = vec![ingress(8080, RuleSource::PeerGroup("lb-2".into()))];
        let err = enforcer.apply("web", other).await.unwrap_err();
        assert!(matches!(err, PolicyError::Platform(_)));
        assert_eq!(enforcer.current("web").unwrap().unwrap().rules, lb_rules());
        assert_eq!(platform.applied_rules("web"), Some(lb_rules()));
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let (enforcer, _, _) = setup();
        let err = enforcer.apply("api", lb_rules()).await.unwrap_err();
        assert!(matches!(err, PolicyError::UnknownService(_)));
    }
}
