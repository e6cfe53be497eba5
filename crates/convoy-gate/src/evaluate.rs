//! Pure gate evaluation.

use std::collections::BTreeSet;

use convoy_core::config::GateConfig;
use convoy_state::{Finding, ScanReport, Severity, StateError};

/// Severity threshold plus CVE allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub threshold: Severity,
    pub ignore: BTreeSet<String>,
}

impl GatePolicy {
    pub fn new(threshold: Severity) -> Self {
        Self {
            threshold,
            ignore: BTreeSet::new(),
        }
    }

    pub fn from_config(cfg: &GateConfig) -> Result<Self, StateError> {
        Ok(Self {
            threshold: cfg.severity_threshold.parse()?,
            ignore: cfg.ignore.iter().map(|c| c.trim().to_string()).collect(),
        })
    }

    pub fn blocks(&self, finding: &Finding) -> bool {
        finding.severity >= self.threshold && !self.ignore.contains(&finding.cve)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    Fail { blocking: Vec<Finding> },
}

impl GateDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateDecision::Pass)
    }
}

/// Decide whether an image may be published.
pub fn evaluate(report: &ScanReport, policy: &GatePolicy) -> GateDecision {
    let blocking: Vec<Finding> = report
        .findings
        .iter()
        .filter(|f| policy.blocks(f))
        .cloned()
        .collect();
    if blocking.is_empty() {
        GateDecision::Pass
    } else {
        GateDecision::Fail { blocking }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::Digest;

    const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    fn finding(severity: Severity, cve: &str) -> Finding {
        Finding {
            severity,
            cve: cve.to_string(),
            package: None,
        }
    }

    fn report(findings: Vec<Finding>) -> ScanReport {
        ScanReport {
            digest: Digest::of(b"img"),
            findings,
            scanned_at: 1000,
        }
    }

    #[test]
    fn empty_report_passes() {
        for threshold in ALL {
            assert!(evaluate(&report(vec![]), &GatePolicy::new(threshold)).is_pass());
        }
    }

    #[test]
    fn single_critical_blocks_at_critical() {
        let r = report(vec![
            finding(Severity::Critical, "CVE-2024-0001"),
            finding(Severity::Low, "CVE-2024-0002"),
        ]);
        match evaluate(&r, &GatePolicy::new(Severity::Critical)) {
            GateDecision::Fail { blocking } => {
                assert_eq!(blocking.len(), 1);
                assert_eq!(blocking[0].cve, "CVE-2024-0001");
            }
            GateDecision::Pass => panic!("critical finding must block"),
        }
    }

    #[test]
    fn pass_iff_no_finding_at_or_above_threshold() {
        for worst in ALL {
            let r = report(vec![finding(worst, "CVE-1"), finding(Severity::Low, "CVE-2")]);
            for threshold in ALL {
                let passed = evaluate(&r, &GatePolicy::new(threshold)).is_pass();
                assert_eq!(passed, worst < threshold, "worst={worst:?} threshold={threshold:?}");
            }
        }
    }

    #[test]
    fn ignored_cve_does_not_block() {
        let mut policy = GatePolicy::new(Severity::High);
        policy.ignore.insert("CVE-2023-4863".to_string());
        let r = report(vec![finding(Severity::Critical, "CVE-2023-4863")]);
        assert!(evaluate(&r, &policy).is_pass());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let r = report(vec![
            finding(Severity::High, "CVE-A"),
            finding(Severity::Critical, "CVE-B"),
        ]);
        let policy = GatePolicy::new(Severity::High);
        assert_eq!(evaluate(&r, &policy), evaluate(&r, &policy));
    }

    #[test]
    fn policy_from_config() {
        let cfg = GateConfig {
            severity_threshold: "HIGH".to_string(),
            ignore: vec![" CVE-1 ".to_string()],
            ..GateConfig::default()
        };
        let policy = GatePolicy::from_config(&cfg).unwrap();
        assert_eq!(policy.threshold, Severity::High);
        assert!(policy.ignore.contains("CVE-1"));

        let bad = GateConfig {
            severity_threshold: "urgent".to_string(),
            ..GateConfig::default()
        };
        assert!(GatePolicy::from_config(&bad).is_err());
    }
}
