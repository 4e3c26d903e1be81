//! `SchemaSnapshot` - read-only projection of one table's current schema
//!
//! Snapshots are fetched on demand and never cached: the remote schema may
//! change between (and during) runs.

use super::table::{quote_literal, TableName};
use crate::executor::{ExecError, Row, SqlExecutor};
use std::fmt;

/// One column as reported by `information_schema.columns`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

/// One index as reported by `pg_indexes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
}

/// One constraint as reported by `information_schema.table_constraints`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintInfo {
    pub name: String,
    /// `PRIMARY KEY`, `UNIQUE`, `CHECK` or `FOREIGN KEY`
    pub kind: String,
}

/// One row-level security policy as reported by `pg_policies`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInfo {
    pub name: String,
    /// `SELECT`, `INSERT`, `UPDATE`, `DELETE` or `ALL`
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    table: TableName,
    exists: bool,
    rls_enabled: bool,
    columns: Vec<ColumnInfo>,
    indexes: Vec<IndexInfo>,
    constraints: Vec<ConstraintInfo>,
    policies: Vec<PolicyInfo>,
}

impl SchemaSnapshot {
    /// Fetch the current state of `table`. Pure read.
    pub fn fetch(executor: &dyn SqlExecutor, table: &TableName) -> Result<Self, ExecError> {
        log::debug!("fetching schema snapshot of {table}");
        let table_rows = executor.query_all(&table_query(table))?;
        if table_rows.is_empty() {
            return Ok(Self::missing(table.clone()));
        }
        let column_rows = executor.query_all(&columns_query(table))?;
        let index_rows = executor.query_all(&indexes_query(table))?;
        let constraint_rows = executor.query_all(&constraints_query(table))?;
        let policy_rows = executor.query_all(&policies_query(table))?;
        Self::from_rows(table.clone(), &table_rows, &column_rows, &index_rows, &constraint_rows)?
            .with_policy_rows(&policy_rows)
    }

    /// Snapshot of a table that does not exist
    pub fn missing(table: TableName) -> Self {
        Self {
            table,
            exists: false,
            rls_enabled: false,
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Assemble a snapshot from the rows of the four catalog queries.
    pub fn from_rows(
        table: TableName,
        table_rows: &[Row],
        column_rows: &[Row],
        index_rows: &[Row],
        constraint_rows: &[Row],
    ) -> Result<Self, ExecError> {
        let Some(table_row) = table_rows.first() else {
            return Ok(Self::missing(table));
        };
        let rls_enabled = table_row.get_bool("rls_enabled").unwrap_or(false);

        let columns = column_rows
            .iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: required(row, "column_name")?,
                    data_type: required(row, "data_type")?,
                    nullable: row.get_bool("is_nullable").unwrap_or(true),
                    default: row.get_str("column_default").map(str::to_string),
                })
            })
            .collect::<Result<Vec<_>, ExecError>>()?;

        let indexes = index_rows
            .iter()
            .map(|row| {
                Ok(IndexInfo {
                    name: required(row, "index_name")?,
                    definition: row.get_str("index_def").unwrap_or_default().to_string(),
                })
            })
            .collect::<Result<Vec<_>, ExecError>>()?;

        let constraints = constraint_rows
            .iter()
            .map(|row| {
                Ok(ConstraintInfo {
                    name: required(row, "constraint_name")?,
                    kind: required(row, "constraint_type")?,
                })
            })
            .collect::<Result<Vec<_>, ExecError>>()?;

        Ok(Self {
            table,
            exists: true,
            rls_enabled,
            columns,
            indexes,
            constraints,
            policies: Vec::new(),
        })
    }

    /// Attach the rows of the `pg_policies` query.
    pub fn with_policy_rows(mut self, policy_rows: &[Row]) -> Result<Self, ExecError> {
        self.policies = policy_rows
            .iter()
            .map(|row| {
                Ok(PolicyInfo {
                    name: required(row, "policy_name")?,
                    command: row.get_str("command").unwrap_or("ALL").to_string(),
                })
            })
            .collect::<Result<Vec<_>, ExecError>>()?;
        Ok(self)
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn rls_enabled(&self) -> bool {
        self.rls_enabled
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn indexes(&self) -> &[IndexInfo] {
        &self.indexes
    }

    pub fn constraints(&self) -> &[ConstraintInfo] {
        &self.constraints
    }

    pub fn policies(&self) -> &[PolicyInfo] {
        &self.policies
    }

    pub fn has_policy(&self, name: &str) -> bool {
        self.policies.iter().any(|p| p.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.name == name)
    }

    pub fn constraint(&self, name: &str) -> Option<&ConstraintInfo> {
        self.constraints.iter().find(|c| c.name == name)
    }

    pub fn has_constraint(&self, name: &str) -> bool {
        self.constraint(name).is_some()
    }

    pub fn primary_key(&self) -> Option<&ConstraintInfo> {
        self.constraints.iter().find(|c| c.kind == "PRIMARY KEY")
    }
}

impl fmt::Display for SchemaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.exists {
            return writeln!(f, "{}: table does not exist", self.table);
        }
        writeln!(
            f,
            "{} (row level security: {})",
            self.table,
            if self.rls_enabled { "enabled" } else { "disabled" }
        )?;
        for column in &self.columns {
            write!(
                f,
                "  - {}: {} {}",
                column.name,
                column.data_type,
                if column.nullable { "NULL" } else { "NOT NULL" }
            )?;
            if let Some(default) = &column.default {
                write!(f, " DEFAULT {default}")?;
            }
            writeln!(f)?;
        }
        for index in &self.indexes {
            writeln!(f, "  index {}", index.name)?;
        }
        for constraint in &self.constraints {
            writeln!(f, "  constraint {} ({})", constraint.name, constraint.kind)?;
        }
        for policy in &self.policies {
            writeln!(f, "  policy \"{}\" FOR {}", policy.name, policy.command)?;
        }
        Ok(())
    }
}

fn required(row: &Row, column: &str) -> Result<String, ExecError> {
    row.get_str(column)
        .map(str::to_string)
        .ok_or_else(|| ExecError::Parse(format!("catalog row is missing '{column}'")))
}

fn table_query(table: &TableName) -> String {
    format!(
        "SELECT c.relname::text AS table_name, c.relrowsecurity::text AS rls_enabled \
         FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = {} AND c.relname = {} AND c.relkind IN ('r', 'p')",
        quote_literal(table.schema()),
        quote_literal(table.name())
    )
}

fn columns_query(table: &TableName) -> String {
    format!(
        "SELECT column_name::text AS column_name, data_type::text AS data_type, \
         is_nullable::text AS is_nullable, column_default::text AS column_default \
         FROM information_schema.columns \
         WHERE table_schema = {} AND table_name = {} \
         ORDER BY ordinal_position",
        quote_literal(table.schema()),
        quote_literal(table.name())
    )
}

fn indexes_query(table: &TableName) -> String {
    format!(
        "SELECT indexname::text AS index_name, indexdef::text AS index_def \
         FROM pg_indexes \
         WHERE schemaname = {} AND tablename = {}",
        quote_literal(table.schema()),
        quote_literal(table.name())
    )
}

fn constraints_query(table: &TableName) -> String {
    format!(
        "SELECT constraint_name::text AS constraint_name, constraint_type::text AS constraint_type \
         FROM information_schema.table_constraints \
         WHERE table_schema = {} AND table_name = {}",
        quote_literal(table.schema()),
        quote_literal(table.name())
    )
}

fn policies_query(table: &TableName) -> String {
    format!(
        "SELECT policyname::text AS policy_name, cmd::text AS command \
         FROM pg_policies \
         WHERE schemaname = {} AND tablename = {}",
        quote_literal(table.schema()),
        quote_literal(table.name())
    )
}
