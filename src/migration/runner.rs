//! Runner - applies a plan step by step and records what happened

use super::classify::ErrorClass;
use super::error::MigrationError;
use super::plan::MigrationPlan;
use super::result::{MigrationResult, RunReport, StepFailure, StepOutcome};
use super::snapshot::SchemaSnapshot;
use super::status::{PlanStatus, StepStatus};
use super::step::MigrationStep;
use crate::config::DatabaseConfig;
use crate::executor::{ExecError, SqlExecutor};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Time budget of a single step when none is configured
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs migration plans against a borrowed executor
///
/// The runner never opens, closes or reopens the connection. It assumes it is
/// the only migration run against the target database.
///
/// # Example
///
/// ```rust,no_run
/// use tidemark::migration::{ColumnSpec, ColumnType, MigrationPlan, Runner, SchemaChange};
/// use tidemark::{connect, DatabaseConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = DatabaseConfig::load()?;
/// let executor = connect(&config)?;
///
/// let plan = MigrationPlan::new("add_recipient_name").change(SchemaChange::add_column(
///     "transactions",
///     ColumnSpec::new("recipient_name", ColumnType::Text),
/// ));
///
/// let report = Runner::from_config(&config).run(&plan, &executor)?;
/// assert!(report.is_success());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Runner {
    step_timeout: Duration,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new().with_step_timeout(config.step_timeout())
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Apply `plan` in order, stopping at the first fatal failure.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidPlan` for an empty plan or duplicate
    /// step names, and `MigrationError::Connection` when the connection check
    /// fails. Both happen before any step runs. Step failures are reported
    /// in the returned `RunReport`, never as errors.
    pub fn run(
        &self,
        plan: &MigrationPlan,
        executor: &dyn SqlExecutor,
    ) -> Result<RunReport, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::run_span(plan.name()).entered();

        plan.validate()?;
        Self::check_connection(executor)?;

        log::info!("Running migration plan '{}' ({} steps)", plan.name(), plan.len());
        let mut report = RunReport::new(plan.name(), plan.len());

        for step in plan.steps() {
            let result = self.run_step(step.as_ref(), executor);
            let fatal = result.outcome.is_failed();
            report.results.push(result);
            if fatal {
                log::error!(
                    "Aborting plan '{}': {} remaining step(s) not attempted",
                    plan.name(),
                    report.skipped_count()
                );
                break;
            }
        }

        log::info!("{report}");
        Ok(report)
    }

    /// Re-fetch the step's table snapshot and evaluate its precondition.
    ///
    /// Pure read; safe to call any number of times.
    pub fn verify(step: &dyn MigrationStep, executor: &dyn SqlExecutor) -> Result<bool, ExecError> {
        let snapshot = SchemaSnapshot::fetch(executor, step.table())?;
        step.is_applied(&snapshot, executor)
    }

    /// Verify every step without applying anything.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Connection` if the connection check fails and
    /// `MigrationError::Verification` if a snapshot cannot be read.
    pub fn status(
        &self,
        plan: &MigrationPlan,
        executor: &dyn SqlExecutor,
    ) -> Result<PlanStatus, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::verify_span(plan.name()).entered();

        plan.validate()?;
        Self::check_connection(executor)?;

        let mut steps = Vec::with_capacity(plan.len());
        for step in plan.steps() {
            let applied = Self::verify(step.as_ref(), executor).map_err(|source| {
                MigrationError::Verification {
                    step: step.name().to_string(),
                    source,
                }
            })?;
            log::debug!("{}: {}", step.name(), if applied { "applied" } else { "pending" });
            steps.push(StepStatus {
                step: step.name().to_string(),
                table: step.table().to_string(),
                applied,
                manual_sql: (!applied).then(|| step.manual_sql()),
            });
        }
        Ok(PlanStatus::new(plan.name(), steps))
    }

    fn check_connection(executor: &dyn SqlExecutor) -> Result<(), MigrationError> {
        executor.check_connection().map_err(|e| {
            log::error!("Connection check failed: {e}");
            MigrationError::Connection(e)
        })
    }

    fn run_step(&self, step: &dyn MigrationStep, executor: &dyn SqlExecutor) -> MigrationResult {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::step_span(step.name(), &step.table().to_string()).entered();

        let start = Instant::now();
        if let Err(e) = executor.set_statement_timeout(Some(self.step_timeout)) {
            log::warn!("Could not set statement timeout for '{}': {e}", step.name());
        }
        let mut outcome = Self::attempt(step, executor);
        if let Err(e) = executor.set_statement_timeout(None) {
            log::warn!("Could not clear statement timeout after '{}': {e}", step.name());
        }

        let elapsed = start.elapsed();
        // Actions that return after the deadline still count as timed out
        if !outcome.is_failed() && elapsed > self.step_timeout {
            log::warn!(
                "Step '{}' took {elapsed:?}, over its {:?} budget",
                step.name(),
                self.step_timeout
            );
            outcome = StepOutcome::Failed(StepFailure::Timeout);
        }

        match &outcome {
            StepOutcome::Applied => log::info!("{}: applied ({elapsed:?})", step.name()),
            StepOutcome::AlreadyApplied => log::info!("{}: already applied", step.name()),
            StepOutcome::Failed(reason) => log::error!("{}: failed: {reason}", step.name()),
        }
        #[cfg(feature = "metrics")]
        METRICS.record_step(outcome.label(), elapsed);

        MigrationResult::new(step.name(), outcome, elapsed)
    }

    fn attempt(step: &dyn MigrationStep, executor: &dyn SqlExecutor) -> StepOutcome {
        match Self::verify(step, executor) {
            Ok(true) => return StepOutcome::AlreadyApplied,
            Ok(false) => {}
            Err(e) => return Self::read_failure(e),
        }

        log::debug!("{}: applying", step.name());
        match step.apply(executor) {
            Ok(()) => match Self::verify(step, executor) {
                Ok(true) => StepOutcome::Applied,
                Ok(false) => {
                    log::warn!("{}: action succeeded but the schema does not reflect it", step.name());
                    StepOutcome::Failed(StepFailure::Postcondition(None))
                }
                Err(e) => Self::read_failure(e),
            },
            Err(err) => Self::recover(step, executor, err),
        }
    }

    /// Classify a failed action; duplicate and missing-object errors get a
    /// second look at the schema before they are judged.
    fn recover(step: &dyn MigrationStep, executor: &dyn SqlExecutor, err: ExecError) -> StepOutcome {
        let class = ErrorClass::of(&err);
        match class {
            ErrorClass::AlreadyExists | ErrorClass::MissingDependency => {
                log::warn!("{}: {err}; re-checking schema", step.name());
                match Self::verify(step, executor) {
                    Ok(true) => {
                        log::info!("{}: confirmed already applied", step.name());
                        StepOutcome::AlreadyApplied
                    }
                    Ok(false) if class == ErrorClass::AlreadyExists => {
                        StepOutcome::Failed(StepFailure::Execution(err.to_string()))
                    }
                    Ok(false) => StepOutcome::Failed(StepFailure::Postcondition(Some(err.to_string()))),
                    Err(e) => Self::read_failure(e),
                }
            }
            ErrorClass::Timeout => StepOutcome::Failed(StepFailure::Timeout),
            ErrorClass::Connection => {
                StepOutcome::Failed(StepFailure::Execution(format!("connection lost: {err}")))
            }
            ErrorClass::Other => StepOutcome::Failed(StepFailure::Execution(err.to_string())),
        }
    }

    fn read_failure(err: ExecError) -> StepOutcome {
        let failure = match ErrorClass::of(&err) {
            ErrorClass::Timeout => StepFailure::Timeout,
            ErrorClass::Connection => StepFailure::Execution(format!("connection lost: {err}")),
            _ => StepFailure::Execution(format!("schema check failed: {err}")),
        };
        StepOutcome::Failed(failure)
    }
}
