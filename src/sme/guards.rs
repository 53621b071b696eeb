//! Safety guards
//!
//! Threshold checks over shadow-evaluation metrics. Guard violations are
//! first-class outcomes, not errors; missing metrics fail the check
//! automatically.

use serde::{Deserialize, Serialize};

use super::shadow::ShadowEvalResult;
use crate::config::GuardThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardViolation {
    pub guard_name: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardResult {
    pub patch_id: String,
    pub passed: bool,
    pub violations: Vec<GuardViolation>,
    pub metrics_available: bool,
}

/// Evaluate the three guards against a shadow result.
pub fn check_guards(shadow: &ShadowEvalResult, thresholds: &GuardThresholds) -> GuardResult {
    let mut violations = Vec::new();
    let mut metrics_available = true;

    match shadow.error_rate_after {
        Some(error_rate) => {
            if error_rate > thresholds.error_rate_max {
                violations.push(GuardViolation {
                    guard_name: "error_rate_max".to_string(),
                    threshold: thresholds.error_rate_max,
                    actual_value: error_rate,
                    severity: Severity::Critical,
                    description: format!(
                        "error rate {:.1}% exceeds maximum {:.1}%",
                        error_rate * 100.0,
                        thresholds.error_rate_max * 100.0
                    ),
                });
            }
        }
        None => metrics_available = false,
    }

    match shadow.latency_p95_delta {
        Some(delta) => {
            if delta > thresholds.latency_p95_regression {
                violations.push(GuardViolation {
                    guard_name: "latency_p95_regression".to_string(),
                    threshold: thresholds.latency_p95_regression,
                    actual_value: delta,
                    severity: Severity::Warning,
                    description: format!(
                        "p95 latency regression {delta:.0}ms exceeds threshold {:.0}ms",
                        thresholds.latency_p95_regression
                    ),
                });
            }
        }
        None => metrics_available = false,
    }

    match shadow.reward_delta {
        Some(delta) => {
            if delta < thresholds.reward_delta_min {
                violations.push(GuardViolation {
                    guard_name: "reward_delta_min".to_string(),
                    threshold: thresholds.reward_delta_min,
                    actual_value: delta,
                    severity: Severity::Critical,
                    description: format!(
                        "reward delta {delta:+.3} below minimum {:+.3}",
                        thresholds.reward_delta_min
                    ),
                });
            }
        }
        None => metrics_available = false,
    }

    GuardResult {
        patch_id: shadow.patch_id.clone(),
        passed: violations.is_empty() && metrics_available,
        violations,
        metrics_available,
    }
}
