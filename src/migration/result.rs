//! Per-step outcomes and the report of one run

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// The forward action failed for a reason other than "already applied"
    #[error("{0}")]
    Execution(String),
    /// The action returned but the step does not read as applied, or it hit
    /// a column/table the plan expected to exist
    #[error("postcondition not met{}", .0.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
    Postcondition(Option<String>),
    /// The step exceeded its time budget
    #[error("timeout")]
    Timeout,
}

/// Terminal state of a step within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    AlreadyApplied,
    Failed(StepFailure),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    /// Label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Applied => "applied",
            StepOutcome::AlreadyApplied => "already_applied",
            StepOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Applied => write!(f, "applied"),
            StepOutcome::AlreadyApplied => write!(f, "already applied"),
            StepOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome record for one attempted step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    pub step: String,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

impl MigrationResult {
    pub fn new(step: impl Into<String>, outcome: StepOutcome, elapsed: Duration) -> Self {
        Self {
            step: step.into(),
            outcome,
            elapsed,
        }
    }
}

/// Ordered results of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub plan: String,
    pub started_at: DateTime<Utc>,
    /// Number of steps in the plan
    pub planned: usize,
    /// One entry per attempted step, in plan order
    pub results: Vec<MigrationResult>,
}

impl RunReport {
    pub fn new(plan: impl Into<String>, planned: usize) -> Self {
        Self {
            plan: plan.into(),
            started_at: Utc::now(),
            planned,
            results: Vec::with_capacity(planned),
        }
    }

    pub fn outcomes(&self) -> Vec<&StepOutcome> {
        self.results.iter().map(|r| &r.outcome).collect()
    }

    pub fn applied_count(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Applied))
    }

    pub fn already_applied_count(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::AlreadyApplied))
    }

    pub fn failed_count(&self) -> usize {
        self.count(StepOutcome::is_failed)
    }

    /// Steps never attempted because an earlier one failed
    pub fn skipped_count(&self) -> usize {
        self.planned.saturating_sub(self.results.len())
    }

    /// The failing result, if any; it is always the last one
    pub fn failed(&self) -> Option<&MigrationResult> {
        self.results.iter().find(|r| r.outcome.is_failed())
    }

    /// Every step of the plan ended `Applied` or `AlreadyApplied`
    pub fn is_success(&self) -> bool {
        self.results.len() == self.planned && self.failed_count() == 0
    }

    pub fn total_elapsed(&self) -> Duration {
        self.results.iter().map(|r| r.elapsed).sum()
    }

    fn count(&self, pred: impl Fn(&StepOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} applied, {} already applied, {} failed, {} skipped",
            self.plan,
            self.applied_count(),
            self.already_applied_count(),
            self.failed_count(),
            self.skipped_count()
        )
    }
}
