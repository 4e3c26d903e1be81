//! Plan status: which steps are applied and which are pending

use std::fmt;

/// Read-only status of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub step: String,
    pub table: String,
    pub applied: bool,
    /// Manual SQL for pending steps
    pub manual_sql: Option<String>,
}

/// Status of a plan against the current schema
#[derive(Debug, Clone)]
pub struct PlanStatus {
    pub plan: String,
    pub steps: Vec<StepStatus>,

    /// Number of applied steps
    pub applied_count: usize,

    /// Number of pending steps
    pub pending_count: usize,
}

impl PlanStatus {
    #[must_use]
    pub fn new(plan: impl Into<String>, steps: Vec<StepStatus>) -> Self {
        let applied_count = steps.iter().filter(|s| s.applied).count();
        let pending_count = steps.len() - applied_count;
        Self {
            plan: plan.into(),
            steps,
            applied_count,
            pending_count,
        }
    }

    /// Check if every step is applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    pub fn pending(&self) -> impl Iterator<Item = &StepStatus> {
        self.steps.iter().filter(|s| !s.applied)
    }

    /// First step still to run
    #[must_use]
    pub fn next_pending(&self) -> Option<&StepStatus> {
        self.pending().next()
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} of {} steps applied",
            self.plan,
            self.applied_count,
            self.steps.len()
        )?;
        if !self.is_up_to_date() {
            write!(f, " ({} pending)", self.pending_count)?;
        }
        Ok(())
    }
}
