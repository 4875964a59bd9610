//! Result aggregation and run verdict
//!
//! The aggregator is the single owner of the result set: worker tasks only
//! send into a channel, nothing else mutates the summary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compare::{CompareStatus, ComparisonResult};
use crate::error::ShotResult;
use crate::shot::{ShotTarget, TargetKey};

/// Which statuses turn the run red
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FailurePolicy {
    pub tolerate_missing_baselines: bool,
    pub fail_on_difference: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            tolerate_missing_baselines: false,
            fail_on_difference: true,
        }
    }
}

impl FailurePolicy {
    pub fn is_failure(&self, status: CompareStatus) -> bool {
        match status {
            CompareStatus::Passed | CompareStatus::NewBaselineCreated => false,
            CompareStatus::Failed => self.fail_on_difference,
            CompareStatus::BaselineMissingAndKept => !self.tolerate_missing_baselines,
            CompareStatus::Error => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub passed: usize,
    pub failed: usize,
    pub new_baseline_created: usize,
    pub baseline_missing: usize,
    pub error: usize,
}

impl StatusCounts {
    fn record(&mut self, status: CompareStatus) {
        match status {
            CompareStatus::Passed => self.passed += 1,
            CompareStatus::Failed => self.failed += 1,
            CompareStatus::NewBaselineCreated => self.new_baseline_created += 1,
            CompareStatus::BaselineMissingAndKept => self.baseline_missing += 1,
            CompareStatus::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.new_baseline_created + self.baseline_missing + self.error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Aggregate of all comparison results. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub counts: StatusCounts,
    pub policy: FailurePolicy,
    /// Sorted by target key
    pub results: Vec<ComparisonResult>,
}

impl RunSummary {
    /// Build a summary from a complete result set
    pub fn from_results(
        mut results: Vec<ComparisonResult>,
        policy: FailurePolicy,
        started_at: DateTime<Utc>,
    ) -> Self {
        results.sort_by(|a, b| a.key.cmp(&b.key));

        let mut counts = StatusCounts::default();
        for result in &results {
            counts.record(result.status);
        }

        let status = if results.iter().any(|r| policy.is_failure(r.status)) {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at,
            duration_ms,
            status,
            counts,
            policy,
            results,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    /// Results that count against the run
    pub fn failures(&self) -> impl Iterator<Item = &ComparisonResult> {
        self.results.iter().filter(|r| self.policy.is_failure(r.status))
    }

    pub fn exit_code(&self) -> i32 {
        exit_code(self)
    }

    /// Write the summary as pretty JSON
    pub fn write_json(&self, path: &Path) -> ShotResult<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path.to_path_buf())
    }
}

/// 0 when everything passed (or was tolerated), 1 on any hard failure
pub fn exit_code(summary: &RunSummary) -> i32 {
    match summary.status {
        RunStatus::Passed => 0,
        RunStatus::Failed => 1,
    }
}

struct Expected {
    id: String,
    display_name: String,
    threshold: f64,
}

/// Join barrier: waits for one result per expected key
pub struct Aggregator {
    expected: BTreeMap<TargetKey, Expected>,
    policy: FailurePolicy,
}

impl Aggregator {
    pub fn new(targets: &[ShotTarget], policy: FailurePolicy) -> Self {
        let expected = targets
            .iter()
            .map(|t| {
                (
                    t.key(),
                    Expected {
                        id: t.id.clone(),
                        display_name: t.display_name.clone(),
                        threshold: t.threshold,
                    },
                )
            })
            .collect();

        Self { expected, policy }
    }

    /// Drain the channel until every sender is gone, then build the summary.
    ///
    /// Keys that never produced a result are recorded as errors.
    pub async fn collect(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ComparisonResult>,
        started_at: DateTime<Utc>,
    ) -> RunSummary {
        let mut results = Vec::with_capacity(self.expected.len());

        while let Some(result) = rx.recv().await {
            if self.expected.remove(&result.key).is_none() {
                warn!("Ignoring unexpected or duplicate result for '{}'", result.key);
                continue;
            }
            results.push(result);
        }

        for (key, missing) in std::mem::take(&mut self.expected) {
            warn!("No result produced for '{}'", key);
            results.push(ComparisonResult::aborted(
                key,
                missing.id,
                missing.display_name,
                missing.threshold,
                "pipeline finished without a result for this shot".to_string(),
            ));
        }

        let summary = RunSummary::from_results(results, self.policy, started_at);
        info!(
            "Shot results: {} passed, {} failed, {} new, {} missing baseline, {} error(s) ({} ms)",
            summary.counts.passed,
            summary.counts.failed,
            summary.counts.new_baseline_created,
            summary.counts.baseline_missing,
            summary.counts.error,
            summary.duration_ms
        );
        summary
    }
}
