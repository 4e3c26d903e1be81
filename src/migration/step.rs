//! MigrationStep trait - one atomic, idempotent schema operation

use super::snapshot::SchemaSnapshot;
use super::table::TableName;
use crate::executor::{ExecError, SqlExecutor};

/// An atomic, idempotent schema operation
///
/// `is_applied` is the precondition check: it must be a pure read, and once
/// it returns `true` the runner never calls `apply`.
///
/// # Example
///
/// ```rust,no_run
/// use tidemark::migration::{MigrationStep, SchemaSnapshot, TableName};
/// use tidemark::{ExecError, SqlExecutor};
///
/// pub struct SeedCurrencies {
///     table: TableName,
/// }
///
/// impl MigrationStep for SeedCurrencies {
///     fn name(&self) -> &str {
///         "seed_currencies"
///     }
///
///     fn table(&self) -> &TableName {
///         &self.table
///     }
///
///     fn is_applied(&self, snapshot: &SchemaSnapshot, executor: &dyn SqlExecutor) -> Result<bool, ExecError> {
///         if !snapshot.exists() {
///             return Ok(false);
///         }
///         let rows = executor.query_all("SELECT COUNT(*)::text AS n FROM currencies")?;
///         Ok(rows.first().and_then(|r| r.get_i64("n")).unwrap_or(0) > 0)
///     }
///
///     fn apply(&self, executor: &dyn SqlExecutor) -> Result<(), ExecError> {
///         executor.execute("INSERT INTO currencies (code) VALUES ('EUR'), ('USD')")?;
///         Ok(())
///     }
///
///     fn manual_sql(&self) -> String {
///         "INSERT INTO currencies (code) VALUES ('EUR'), ('USD');".to_string()
///     }
/// }
/// ```
pub trait MigrationStep {
    /// Unique name of the step within its plan
    fn name(&self) -> &str;

    /// Table whose snapshot drives the checks
    fn table(&self) -> &TableName;

    /// Whether the step's effect is already present.
    ///
    /// # Errors
    ///
    /// Returns `ExecError` if a supporting read query fails.
    fn is_applied(
        &self,
        snapshot: &SchemaSnapshot,
        executor: &dyn SqlExecutor,
    ) -> Result<bool, ExecError>;

    /// Forward action
    ///
    /// # Errors
    ///
    /// Returns the `ExecError` of the first statement that failed.
    fn apply(&self, executor: &dyn SqlExecutor) -> Result<(), ExecError>;

    /// SQL an operator can run by hand to get the same effect
    fn manual_sql(&self) -> String;

    /// Static checks run before any step of the plan executes
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl<T: MigrationStep + ?Sized> MigrationStep for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn table(&self) -> &TableName {
        (**self).table()
    }

    fn is_applied(
        &self,
        snapshot: &SchemaSnapshot,
        executor: &dyn SqlExecutor,
    ) -> Result<bool, ExecError> {
        (**self).is_applied(snapshot, executor)
    }

    fn apply(&self, executor: &dyn SqlExecutor) -> Result<(), ExecError> {
        (**self).apply(executor)
    }

    fn manual_sql(&self) -> String {
        (**self).manual_sql()
    }

    fn validate(&self) -> Result<(), String> {
        (**self).validate()
    }
}
