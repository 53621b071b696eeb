//! Canary deployments
//!
//! Live traffic splitting for a promoted patch. Routing decisions sit on the
//! hot path of every generating request, so they are O(1) under a plain
//! mutex; derived rates are computed on read. Guards are evaluated after
//! every recorded request once the minimum sample count is reached, and the
//! first violation rolls the canary back.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GuardThresholds;

/// Minimum canary samples before guard evaluation.
pub const MIN_CANARY_SAMPLES: u64 = 5;

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStatus {
    Active,
    Completed,
    RolledBack,
    Superseded,
}

/// Counters and sums for both request cohorts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanaryMetrics {
    pub total_requests: u64,
    pub canary_requests: u64,
    pub baseline_errors: u64,
    pub canary_errors: u64,
    pub baseline_latency_sum: f64,
    pub canary_latency_sum: f64,
    pub baseline_reward_sum: f64,
    pub canary_reward_sum: f64,
    pub violations: Vec<String>,
}

impl CanaryMetrics {
    fn baseline_requests(&self) -> u64 {
        self.total_requests - self.canary_requests
    }

    pub fn canary_error_rate(&self) -> f64 {
        if self.canary_requests == 0 {
            0.0
        } else {
            self.canary_errors as f64 / self.canary_requests as f64
        }
    }

    pub fn baseline_error_rate(&self) -> f64 {
        let n = self.baseline_requests();
        if n == 0 {
            0.0
        } else {
            self.baseline_errors as f64 / n as f64
        }
    }

    pub fn canary_avg_latency(&self) -> f64 {
        if self.canary_requests == 0 {
            0.0
        } else {
            self.canary_latency_sum / self.canary_requests as f64
        }
    }

    pub fn baseline_avg_latency(&self) -> f64 {
        let n = self.baseline_requests();
        if n == 0 {
            0.0
        } else {
            self.baseline_latency_sum / n as f64
        }
    }

    pub fn canary_avg_reward(&self) -> f64 {
        if self.canary_requests == 0 {
            0.0
        } else {
            self.canary_reward_sum / self.canary_requests as f64
        }
    }

    pub fn baseline_avg_reward(&self) -> f64 {
        let n = self.baseline_requests();
        if n == 0 {
            0.0
        } else {
            self.baseline_reward_sum / n as f64
        }
    }

    pub fn reward_delta(&self) -> f64 {
        self.canary_avg_reward() - self.baseline_avg_reward()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryDeployment {
    pub patch_id: String,
    pub traffic_share: f64,
    pub start_time: f64,
    pub target_runs: u64,
    pub status: CanaryStatus,
    pub rollback_reason: Option<String>,
    pub metrics: CanaryMetrics,
}

impl CanaryDeployment {
    pub fn progress(&self) -> f64 {
        if self.target_runs == 0 {
            1.0
        } else {
            (self.metrics.canary_requests as f64 / self.target_runs as f64).min(1.0)
        }
    }
}

pub struct CanaryManager {
    canaries: Mutex<HashMap<String, CanaryDeployment>>,
    thresholds: GuardThresholds,
}

impl CanaryManager {
    pub fn new(thresholds: GuardThresholds) -> Self {
        Self {
            canaries: Mutex::new(HashMap::new()),
            thresholds,
        }
    }

    /// Start a canary for a patch. Any currently active canary (this patch's
    /// or another's) is superseded; at most one is active at a time.
    pub fn start_canary(
        &self,
        patch_id: &str,
        traffic_share: f64,
        target_runs: u64,
    ) -> CanaryDeployment {
        let mut canaries = match self.canaries.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        for canary in canaries.values_mut() {
            if canary.status == CanaryStatus::Active {
                canary.status = CanaryStatus::Superseded;
            }
        }

        let deployment = CanaryDeployment {
            patch_id: patch_id.to_string(),
            traffic_share: traffic_share.clamp(0.0, 1.0),
            start_time: unix_now(),
            target_runs,
            status: CanaryStatus::Active,
            rollback_reason: None,
            metrics: CanaryMetrics::default(),
        };
        canaries.insert(patch_id.to_string(), deployment.clone());
        info!(
            patch_id,
            traffic_share, target_runs, "canary deployment started"
        );
        deployment
    }

    pub fn get(&self, patch_id: &str) -> Option<CanaryDeployment> {
        self.canaries.lock().ok()?.get(patch_id).cloned()
    }

    pub fn active(&self) -> Option<CanaryDeployment> {
        let canaries = self.canaries.lock().ok()?;
        canaries
            .values()
            .find(|c| c.status == CanaryStatus::Active)
            .cloned()
    }

    /// Routing decision for an incoming request: Bernoulli trial with the
    /// active canary's traffic share while it still needs samples.
    pub fn should_use_canary(&self) -> (bool, Option<String>) {
        let Ok(canaries) = self.canaries.lock() else {
            return (false, None);
        };
        let Some(canary) = canaries.values().find(|c| c.status == CanaryStatus::Active) else {
            return (false, None);
        };
        if canary.metrics.canary_requests >= canary.target_runs {
            return (false, None);
        }
        if rand::random::<f64>() < canary.traffic_share {
            (true, Some(canary.patch_id.clone()))
        } else {
            (false, None)
        }
    }

    /// Record one request's outcome. Guards run after every recorded request
    /// once the minimum sample count is reached; the first violation rolls
    /// the canary back and is returned.
    pub fn record_request(
        &self,
        routed_patch_id: Option<&str>,
        error: bool,
        latency_ms: f64,
        reward: f64,
    ) -> Option<String> {
        let mut canaries = match self.canaries.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let canary = canaries
            .values_mut()
            .find(|c| c.status == CanaryStatus::Active)?;

        let metrics = &mut canary.metrics;
        metrics.total_requests += 1;
        if routed_patch_id == Some(canary.patch_id.as_str()) {
            metrics.canary_requests += 1;
            if error {
                metrics.canary_errors += 1;
            }
            metrics.canary_latency_sum += latency_ms;
            metrics.canary_reward_sum += reward;
        } else {
            if error {
                metrics.baseline_errors += 1;
            }
            metrics.baseline_latency_sum += latency_ms;
            metrics.baseline_reward_sum += reward;
        }

        if let Some(violation) = Self::guard_violation(&self.thresholds, metrics) {
            metrics.violations.push(violation.clone());
            canary.status = CanaryStatus::RolledBack;
            canary.rollback_reason = Some(violation.clone());
            warn!(patch_id = %canary.patch_id, "canary rolled back: {violation}");
            return Some(violation);
        }

        if canary.metrics.canary_requests >= canary.target_runs {
            canary.status = CanaryStatus::Completed;
            info!(
                patch_id = %canary.patch_id,
                runs = canary.metrics.canary_requests,
                "canary completed"
            );
        }
        None
    }

    fn guard_violation(thresholds: &GuardThresholds, metrics: &CanaryMetrics) -> Option<String> {
        if metrics.canary_requests < MIN_CANARY_SAMPLES {
            return None;
        }

        let error_rate = metrics.canary_error_rate();
        if error_rate > thresholds.error_rate_max {
            return Some(format!(
                "error rate {:.2}% > {:.2}%",
                error_rate * 100.0,
                thresholds.error_rate_max * 100.0
            ));
        }

        let latency_delta = metrics.canary_avg_latency() - metrics.baseline_avg_latency();
        if latency_delta > thresholds.latency_p95_regression {
            return Some(format!(
                "latency regression {latency_delta:.0}ms > {:.0}ms",
                thresholds.latency_p95_regression
            ));
        }

        let reward_delta = metrics.reward_delta();
        // Reward comparison needs a baseline cohort to compare against.
        if metrics.baseline_requests() > 0 && reward_delta < thresholds.reward_delta_min {
            return Some(format!(
                "reward delta {reward_delta:.3} < {}",
                thresholds.reward_delta_min
            ));
        }

        None
    }

    /// Cooperative rollback: flips status; routing sees it on the next read.
    pub fn rollback(&self, patch_id: &str, reason: &str) {
        let mut canaries = match self.canaries.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(canary) = canaries.get_mut(patch_id) {
            if canary.status == CanaryStatus::Active {
                canary.status = CanaryStatus::RolledBack;
                canary.rollback_reason = Some(reason.to_string());
                warn!(patch_id, "canary rolled back: {reason}");
            }
        }
    }

    pub fn all(&self) -> Vec<CanaryDeployment> {
        self.canaries
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove non-active records older than the given age.
    pub fn cleanup_old(&self, max_age_secs: f64) {
        let cutoff = unix_now() - max_age_secs;
        let mut canaries = match self.canaries.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = canaries.len();
        canaries.retain(|_, c| c.status == CanaryStatus::Active || c.start_time >= cutoff);
        let removed = before - canaries.len();
        if removed > 0 {
            info!(removed, "cleaned up old canary records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CanaryManager {
        CanaryManager::new(GuardThresholds::default())
    }

    #[test]
    fn routing_honors_traffic_share_extremes() {
        let m = manager();
        m.start_canary("p1", 1.0, 10);
        let (used, patch) = m.should_use_canary();
        assert!(used);
        assert_eq!(patch.as_deref(), Some("p1"));

        m.start_canary("p2", 0.0, 10);
        let (used, patch) = m.should_use_canary();
        assert!(!used);
        assert_eq!(patch, None);
    }

    #[test]
    fn errors_trip_guards_and_roll_back() {
        let m = manager();
        m.start_canary("p1", 1.0, 10);

        // First four error requests stay under the minimum sample count.
        for _ in 0..4 {
            assert_eq!(m.record_request(Some("p1"), true, 100.0, 0.5), None);
        }
        let violation = m.record_request(Some("p1"), true, 100.0, 0.5);
        assert!(violation.is_some());

        let canary = m.get("p1").unwrap();
        assert_eq!(canary.status, CanaryStatus::RolledBack);
        assert!(canary.rollback_reason.unwrap().contains("error rate"));
        // Routing immediately sees the rollback.
        assert_eq!(m.should_use_canary(), (false, None));
    }

    #[test]
    fn target_runs_complete_the_canary() {
        let m = manager();
        m.start_canary("p1", 1.0, 6);
        for _ in 0..6 {
            m.record_request(Some("p1"), false, 100.0, 0.8);
        }
        let canary = m.get("p1").unwrap();
        assert_eq!(canary.status, CanaryStatus::Completed);
        assert_eq!(canary.metrics.canary_requests, 6);
        assert!(canary.metrics.canary_requests <= canary.metrics.total_requests);
        assert!(canary.metrics.canary_requests <= canary.target_runs);
        assert_eq!(m.should_use_canary(), (false, None));
    }

    #[test]
    fn reward_regression_rolls_back() {
        let m = manager();
        m.start_canary("p1", 0.5, 100);
        // Baseline cohort earns well; canary cohort earns poorly.
        for _ in 0..10 {
            m.record_request(None, false, 100.0, 0.9);
        }
        let mut violation = None;
        for _ in 0..10 {
            violation = m.record_request(Some("p1"), false, 100.0, 0.1);
            if violation.is_some() {
                break;
            }
        }
        assert!(violation.unwrap().contains("reward delta"));
    }

    #[test]
    fn new_canary_supersedes_active_one() {
        let m = manager();
        m.start_canary("old", 1.0, 10);
        m.start_canary("new", 1.0, 10);
        assert_eq!(m.get("old").unwrap().status, CanaryStatus::Superseded);
        assert_eq!(m.active().unwrap().patch_id, "new");
        // At most one active across the process.
        let active_count = m
            .all()
            .iter()
            .filter(|c| c.status == CanaryStatus::Active)
            .count();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn rolled_back_canary_never_reactivates() {
        let m = manager();
        m.start_canary("p1", 1.0, 10);
        m.rollback("p1", "manual");
        assert_eq!(m.get("p1").unwrap().status, CanaryStatus::RolledBack);
        m.rollback("p1", "again");
        assert_eq!(
            m.get("p1").unwrap().rollback_reason.as_deref(),
            Some("manual")
        );
        assert!(m.active().is_none());
    }

    #[test]
    fn cleanup_retains_active_and_recent() {
        let m = manager();
        m.start_canary("done", 1.0, 1);
        m.record_request(Some("done"), false, 10.0, 0.9);
        m.start_canary("live", 1.0, 10);
        // Nothing is old enough to sweep yet.
        m.cleanup_old(3600.0);
        assert_eq!(m.all().len(), 2);
        // Zero-age cutoff sweeps the completed record, keeps the active one.
        m.cleanup_old(-1.0);
        let remaining = m.all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].patch_id, "live");
    }
}
