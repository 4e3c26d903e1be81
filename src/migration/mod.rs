//! Idempotent, verifiable schema migrations
//!
//! This module provides:
//! - the `MigrationStep` trait and the built-in `SchemaChange` steps
//! - `SchemaSnapshot`, the on-demand view of a table that drives every check
//! - `MigrationPlan`, an ordered list of uniquely named steps
//! - `Runner`, which applies a plan and reports one result per attempted step
//!
//! # Example
//!
//! ```rust,no_run
//! use tidemark::migration::{ColumnSpec, ColumnType, IndexSpec, MigrationPlan, Runner, SchemaChange};
//! use tidemark::{connect, DatabaseConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = MigrationPlan::new("add_file_source")
//!     .change(SchemaChange::add_column(
//!         "transactions",
//!         ColumnSpec::new("file_source", ColumnType::Varchar(255)),
//!     ))
//!     .change(SchemaChange::create_index(
//!         "transactions",
//!         IndexSpec::new("idx_transactions_file_source")
//!             .column("file_source")
//!             .predicate("file_source IS NOT NULL"),
//!     ))
//!     .change(SchemaChange::backfill("transactions", "file_source", "legacy"));
//!
//! let config = DatabaseConfig::load()?;
//! let executor = connect(&config)?;
//! let report = Runner::from_config(&config).run(&plan, &executor)?;
//! for result in &report.results {
//!     println!("{}: {}", result.step, result.outcome);
//! }
//! # Ok(())
//! # }
//! ```

pub mod change;
pub mod classify;
pub mod error;
pub mod plan;
pub mod result;
pub mod runner;
pub mod snapshot;
pub mod status;
pub mod step;
pub mod table;

pub use change::{
    ChangeStep, ColumnSpec, ColumnType, ConstraintKind, IndexSpec, PolicyCommand, PolicySpec,
    SchemaChange,
};
pub use classify::ErrorClass;
pub use error::MigrationError;
pub use plan::MigrationPlan;
pub use result::{MigrationResult, RunReport, StepFailure, StepOutcome};
pub use runner::{Runner, DEFAULT_STEP_TIMEOUT};
pub use snapshot::{ColumnInfo, ConstraintInfo, IndexInfo, PolicyInfo, SchemaSnapshot};
pub use status::{PlanStatus, StepStatus};
pub use step::MigrationStep;
pub use table::TableName;
