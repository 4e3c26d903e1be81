//! MigrationPlan - a named, ordered sequence of steps

use super::change::{ChangeStep, SchemaChange};
use super::error::MigrationError;
use super::step::MigrationStep;
use super::table::TableName;
use std::collections::HashSet;

/// Steps run in declared order; names are unique within the plan.
///
/// # Example
///
/// ```rust
/// use tidemark::migration::{ColumnSpec, ColumnType, IndexSpec, MigrationPlan, SchemaChange};
///
/// let plan = MigrationPlan::new("add_file_source")
///     .change(SchemaChange::add_column(
///         "transactions",
///         ColumnSpec::new("file_source", ColumnType::Varchar(255)),
///     ))
///     .change(SchemaChange::create_index(
///         "transactions",
///         IndexSpec::new("idx_transactions_file_source").column("file_source"),
///     ));
///
/// assert_eq!(plan.len(), 2);
/// assert!(plan.validate().is_ok());
/// ```
pub struct MigrationPlan {
    name: String,
    steps: Vec<Box<dyn MigrationStep>>,
}

impl MigrationPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn add(mut self, step: impl MigrationStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a built-in change under its default step name
    pub fn change(self, change: SchemaChange) -> Self {
        self.add(ChangeStep::new(change))
    }

    /// Append a built-in change under an explicit step name
    pub fn named_change(self, name: impl Into<String>, change: SchemaChange) -> Self {
        self.add(ChangeStep::named(name, change))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Box<dyn MigrationStep>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct tables the plan touches, in first-use order
    pub fn tables(&self) -> Vec<&TableName> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|s| s.table())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Manual SQL of every step, one statement per line
    pub fn manual_sql(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.manual_sql())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Reject empty plans, duplicate step names and invalid steps.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let invalid = |reason: String| MigrationError::InvalidPlan {
            plan: self.name.clone(),
            reason,
        };
        if self.steps.is_empty() {
            return Err(invalid("plan has no steps".to_string()));
        }
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name())));
            }
            step.validate()
                .map_err(|reason| invalid(format!("step '{}': {reason}", step.name())))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MigrationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationPlan")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}
