//! Scanning with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use convoy_core::{ImageRef, RetryPolicy};
use convoy_platform::Scanner;
use convoy_state::ScanReport;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("scanner unavailable after {attempts} attempt(s): {reason}")]
    ScanUnavailable { attempts: u32, reason: String },
}

pub struct VulnerabilityGate {
    scanner: Arc<dyn Scanner>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl VulnerabilityGate {
    pub fn new(scanner: Arc<dyn Scanner>, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            scanner,
            retry,
            attempt_timeout,
        }
    }

    /// Scan an image. An attempt that exceeds the timeout, or whose report
    /// belongs to a different digest than the pinned image, counts as a
    /// failed attempt.
    pub async fn scan(&self, image: &ImageRef) -> Result<ScanReport, GateError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reason =
                match tokio::time::timeout(self.attempt_timeout, self.scanner.scan(image)).await {
                    Ok(Ok(report)) => match &image.digest {
                        Some(expected) if *expected != report.digest => format!(
                            "scanner reported digest {} for image {}",
                            report.digest, expected
                        ),
                        _ => {
                            debug!(%image, findings = report.findings.len(), attempt, "scan complete");
                            return Ok(report);
                        }
                    },
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("scan timed out after {:?}", self.attempt_timeout),
                };

            if !self.retry.should_retry(attempt) {
                warn!(%image, attempt, %reason, "scanner unavailable, giving up");
                return Err(GateError::ScanUnavailable {
                    attempts: attempt,
                    reason,
                });
            }

            let delay = self.retry.delay_after(attempt);
            warn!(%image, attempt, ?delay, %reason, "scan failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
