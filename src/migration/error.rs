//! Migration-specific error types

use crate::executor::ExecError;
use thiserror::Error;

/// Errors that stop a run before it produces a report
///
/// Step-level failures never appear here; they are recorded as
/// [`super::StepOutcome::Failed`] in the run's report.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Cannot reach or authenticate to the database
    #[error(
        "Cannot connect to the database: {0}\n\
         Check the database URL and that the credential is an administrative (service-role) key."
    )]
    Connection(#[source] ExecError),
    /// Plan cannot be run as declared
    #[error("Invalid migration plan '{plan}': {reason}")]
    InvalidPlan { plan: String, reason: String },
    /// A status check could not read the schema
    #[error("Verification of step '{step}' failed: {source}")]
    Verification {
        step: String,
        #[source]
        source: ExecError,
    },
}
