//! Built-in declarative schema changes
//!
//! DDL is rendered with SeaQuery's `PostgresQueryBuilder`; data and
//! constraint statements are rendered by hand with quoted identifiers.
//! Forward SQL never carries `IF NOT EXISTS`: the snapshot check guards it,
//! and a duplicate error on a stale check goes through the runner's
//! already-applied path. The manual SQL shown to operators does carry it.

use super::snapshot::SchemaSnapshot;
use super::step::MigrationStep;
use super::table::{is_valid_identifier, quote_ident, quote_literal, TableName};
use crate::executor::{ExecError, SqlExecutor};
use sea_query::{ColumnDef, Expr, Index, IntoIden, PostgresQueryBuilder, SchemaName, Table};

/// Column types the built-in changes can add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Varchar(u32),
    Uuid,
    /// precision, scale
    Decimal(u32, u32),
    Integer,
    BigInt,
    Boolean,
    TimestampTz,
}

impl ColumnType {
    fn apply_to(self, def: &mut ColumnDef) {
        match self {
            ColumnType::Text => def.text(),
            ColumnType::Varchar(len) => def.string_len(len),
            ColumnType::Uuid => def.uuid(),
            ColumnType::Decimal(precision, scale) => def.decimal_len(precision, scale),
            ColumnType::Integer => def.integer(),
            ColumnType::BigInt => def.big_integer(),
            ColumnType::Boolean => def.boolean(),
            ColumnType::TimestampTz => def.timestamp_with_time_zone(),
        };
    }

    /// Type as written in SQL
    pub fn sql(self) -> String {
        match self {
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Varchar(len) => format!("VARCHAR({len})"),
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Decimal(precision, scale) => format!("DECIMAL({precision},{scale})"),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::TimestampTz => "TIMESTAMPTZ".to_string(),
        }
    }

    /// `information_schema.columns.data_type` spelling
    pub fn catalog_name(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Varchar(_) => "character varying",
            ColumnType::Uuid => "uuid",
            ColumnType::Decimal(..) => "numeric",
            ColumnType::Integer => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Boolean => "boolean",
            ColumnType::TimestampTz => "timestamp with time zone",
        }
    }
}

/// Definition of a column to add
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// SQL default expression, e.g. `gen_random_uuid()`
    pub default: Option<String>,
    pub primary_key: bool,
    /// Foreign-key target, e.g. `auth.users(id) ON DELETE CASCADE`
    pub references: Option<String>,
}

impl ColumnSpec {
    /// Nullable column without a default
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            primary_key: false,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Single-column primary key; implies `NOT NULL`
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn references(mut self, target: impl Into<String>) -> Self {
        self.references = Some(target.into());
        self
    }

    fn column_def(&self) -> ColumnDef {
        let mut def = ColumnDef::new(self.name.clone());
        self.column_type.apply_to(&mut def);
        if self.nullable {
            def.null();
        } else {
            def.not_null();
        }
        if let Some(expr) = &self.default {
            def.default(Expr::cust(expr.clone()));
        }
        if self.primary_key {
            def.primary_key();
        }
        if let Some(target) = &self.references {
            def.extra(format!("REFERENCES {target}"));
        }
        def
    }

    fn manual_definition(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.column_type.sql());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(expr) = &self.default {
            sql.push_str(&format!(" DEFAULT {expr}"));
        }
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if let Some(target) = &self.references {
            sql.push_str(&format!(" REFERENCES {target}"));
        }
        sql
    }
}

/// Definition of an index to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Partial-index predicate, without the `WHERE`
    pub predicate: Option<String>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            unique: false,
            predicate: None,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }
}

/// Kind of table constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
    /// Boolean SQL expression
    Check(String),
}

impl ConstraintKind {
    fn body(&self, quote: fn(&str) -> String) -> String {
        let list = |columns: &[String]| {
            columns
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            ConstraintKind::PrimaryKey(columns) => format!("PRIMARY KEY ({})", list(columns)),
            ConstraintKind::Unique(columns) => format!("UNIQUE ({})", list(columns)),
            ConstraintKind::Check(expr) => format!("CHECK ({expr})"),
        }
    }

    fn columns(&self) -> &[String] {
        match self {
            ConstraintKind::PrimaryKey(columns) | ConstraintKind::Unique(columns) => columns,
            ConstraintKind::Check(_) => &[],
        }
    }
}

/// Command a row-level security policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyCommand {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub fn sql(self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }
}

/// Definition of a row-level security policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySpec {
    /// Free-form policy name, e.g. `Users can only see their own rows`
    pub name: String,
    pub command: PolicyCommand,
    /// Visibility predicate, without the `USING`
    pub using: Option<String>,
    /// Predicate new rows must satisfy, without the `WITH CHECK`
    pub with_check: Option<String>,
}

impl PolicySpec {
    pub fn new(name: impl Into<String>, command: PolicyCommand) -> Self {
        Self {
            name: name.into(),
            command,
            using: None,
            with_check: None,
        }
    }

    pub fn using(mut self, expr: impl Into<String>) -> Self {
        self.using = Some(expr.into());
        self
    }

    pub fn with_check(mut self, expr: impl Into<String>) -> Self {
        self.with_check = Some(expr.into());
        self
    }

    fn body(&self) -> String {
        let mut sql = format!("FOR {}", self.command.sql());
        if let Some(expr) = &self.using {
            sql.push_str(&format!(" USING ({expr})"));
        }
        if let Some(expr) = &self.with_check {
            sql.push_str(&format!(" WITH CHECK ({expr})"));
        }
        sql
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() || self.name.len() > 63 {
            return Err(format!("invalid policy name '{}'", self.name));
        }
        match (self.command, &self.using, &self.with_check) {
            (_, None, None) => Err(format!(
                "policy '{}' has no USING or WITH CHECK expression",
                self.name
            )),
            (PolicyCommand::Insert, Some(_), _) => {
                Err(format!("INSERT policy '{}' takes WITH CHECK only", self.name))
            }
            (PolicyCommand::Select | PolicyCommand::Delete, _, Some(_)) => Err(format!(
                "{} policy '{}' takes USING only",
                self.command.sql(),
                self.name
            )),
            _ => Ok(()),
        }
    }
}

/// A declarative schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable {
        table: TableName,
        columns: Vec<ColumnSpec>,
    },
    AddColumn {
        table: TableName,
        column: ColumnSpec,
    },
    DropColumn {
        table: TableName,
        column: String,
    },
    CreateIndex {
        table: TableName,
        index: IndexSpec,
    },
    /// Set `column = value` on every row where it is NULL
    Backfill {
        table: TableName,
        column: String,
        value: String,
    },
    AddConstraint {
        table: TableName,
        name: String,
        kind: ConstraintKind,
    },
    EnableRowLevelSecurity {
        table: TableName,
    },
    CreatePolicy {
        table: TableName,
        policy: PolicySpec,
    },
}

impl SchemaChange {
    pub fn create_table(
        table: impl Into<TableName>,
        columns: impl IntoIterator<Item = ColumnSpec>,
    ) -> Self {
        SchemaChange::CreateTable {
            table: table.into(),
            columns: columns.into_iter().collect(),
        }
    }

    pub fn add_column(table: impl Into<TableName>, column: ColumnSpec) -> Self {
        SchemaChange::AddColumn {
            table: table.into(),
            column,
        }
    }

    pub fn drop_column(table: impl Into<TableName>, column: impl Into<String>) -> Self {
        SchemaChange::DropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn create_index(table: impl Into<TableName>, index: IndexSpec) -> Self {
        SchemaChange::CreateIndex {
            table: table.into(),
            index,
        }
    }

    pub fn backfill(
        table: impl Into<TableName>,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        SchemaChange::Backfill {
            table: table.into(),
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn add_constraint(
        table: impl Into<TableName>,
        name: impl Into<String>,
        kind: ConstraintKind,
    ) -> Self {
        SchemaChange::AddConstraint {
            table: table.into(),
            name: name.into(),
            kind,
        }
    }

    pub fn enable_row_level_security(table: impl Into<TableName>) -> Self {
        SchemaChange::EnableRowLevelSecurity {
            table: table.into(),
        }
    }

    pub fn create_policy(table: impl Into<TableName>, policy: PolicySpec) -> Self {
        SchemaChange::CreatePolicy {
            table: table.into(),
            policy,
        }
    }

    pub fn table(&self) -> &TableName {
        match self {
            SchemaChange::CreateTable { table, .. }
            | SchemaChange::AddColumn { table, .. }
            | SchemaChange::DropColumn { table, .. }
            | SchemaChange::CreateIndex { table, .. }
            | SchemaChange::Backfill { table, .. }
            | SchemaChange::AddConstraint { table, .. }
            | SchemaChange::EnableRowLevelSecurity { table }
            | SchemaChange::CreatePolicy { table, .. } => table,
        }
    }

    /// Step name used when the plan does not supply one
    pub fn default_name(&self) -> String {
        match self {
            SchemaChange::CreateTable { table, .. } => format!("create_{}_table", table.name()),
            SchemaChange::AddColumn { column, .. } => format!("add_{}_column", column.name),
            SchemaChange::DropColumn { column, .. } => format!("drop_{column}_column"),
            SchemaChange::CreateIndex { index, .. } => format!("create_{}", index.name),
            SchemaChange::Backfill { column, .. } => format!("backfill_{column}"),
            SchemaChange::AddConstraint { name, .. } => format!("add_{name}"),
            SchemaChange::EnableRowLevelSecurity { table } => {
                format!("enable_rls_{}", table.name())
            }
            SchemaChange::CreatePolicy { policy, .. } => {
                format!("create_policy_{}", slug(&policy.name))
            }
        }
    }

    /// Statements of the forward action, in execution order
    pub fn forward_sql(&self) -> Vec<String> {
        match self {
            SchemaChange::CreateTable { table, columns } => {
                let mut create = Table::create();
                create.table(sea_table(table));
                for column in columns {
                    create.col(column.column_def());
                }
                vec![create.build(PostgresQueryBuilder)]
            }
            SchemaChange::AddColumn { table, column } => {
                let alter = Table::alter()
                    .table(sea_table(table))
                    .add_column(column.column_def())
                    .to_owned();
                vec![alter.build(PostgresQueryBuilder)]
            }
            SchemaChange::DropColumn { table, column } => {
                let alter = Table::alter()
                    .table(sea_table(table))
                    .drop_column(column.clone())
                    .to_owned();
                vec![alter.build(PostgresQueryBuilder)]
            }
            SchemaChange::CreateIndex { table, index } => {
                let mut create = Index::create();
                create.name(index.name.clone()).table(sea_table(table));
                for column in &index.columns {
                    create.col(column.clone());
                }
                if index.unique {
                    create.unique();
                }
                let mut sql = create.build(PostgresQueryBuilder);
                if let Some(predicate) = &index.predicate {
                    sql.push_str(&format!(" WHERE {predicate}"));
                }
                vec![sql]
            }
            SchemaChange::Backfill {
                table,
                column,
                value,
            } => vec![format!(
                "UPDATE {} SET {col} = {} WHERE {col} IS NULL",
                table.quoted(),
                quote_literal(value),
                col = quote_ident(column)
            )],
            SchemaChange::AddConstraint { table, name, kind } => vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table.quoted(),
                quote_ident(name),
                kind.body(quote_ident)
            )],
            SchemaChange::EnableRowLevelSecurity { table } => vec![format!(
                "ALTER TABLE {} ENABLE ROW LEVEL SECURITY",
                table.quoted()
            )],
            SchemaChange::CreatePolicy { table, policy } => vec![format!(
                "CREATE POLICY {} ON {} {}",
                quote_ident(&policy.name),
                table.quoted(),
                policy.body()
            )],
        }
    }

    /// Hand-runnable equivalent, guarded where Postgres allows it
    pub fn manual_sql(&self) -> String {
        match self {
            SchemaChange::CreateTable { table, columns } => format!(
                "CREATE TABLE IF NOT EXISTS {table} ({});",
                columns
                    .iter()
                    .map(ColumnSpec::manual_definition)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            SchemaChange::AddColumn { table, column } => format!(
                "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {};",
                column.manual_definition()
            ),
            SchemaChange::DropColumn { table, column } => {
                format!("ALTER TABLE {table} DROP COLUMN IF EXISTS {column};")
            }
            SchemaChange::CreateIndex { table, index } => {
                let mut sql = format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {table} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    index.name,
                    index.columns.join(", ")
                );
                if let Some(predicate) = &index.predicate {
                    sql.push_str(&format!(" WHERE {predicate}"));
                }
                sql.push(';');
                sql
            }
            SchemaChange::Backfill {
                table,
                column,
                value,
            } => format!(
                "UPDATE {table} SET {column} = {} WHERE {column} IS NULL;",
                quote_literal(value)
            ),
            SchemaChange::AddConstraint { table, name, kind } => format!(
                "ALTER TABLE {table} ADD CONSTRAINT {name} {};",
                kind.body(|c| c.to_string())
            ),
            SchemaChange::EnableRowLevelSecurity { table } => {
                format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY;")
            }
            // CREATE POLICY has no IF NOT EXISTS
            SchemaChange::CreatePolicy { table, policy } => {
                let name = quote_ident(&policy.name);
                format!(
                    "DROP POLICY IF EXISTS {name} ON {table};\nCREATE POLICY {name} ON {table} {};",
                    policy.body()
                )
            }
        }
    }

    /// Whether the change's effect is present
    pub fn is_applied(
        &self,
        snapshot: &SchemaSnapshot,
        executor: &dyn SqlExecutor,
    ) -> Result<bool, ExecError> {
        if !snapshot.exists() {
            return Ok(false);
        }
        Ok(match self {
            SchemaChange::CreateTable { columns, .. } => {
                for column in columns.iter().filter(|c| !snapshot.has_column(&c.name)) {
                    log::warn!(
                        "table {} exists without column '{}'",
                        snapshot.table(),
                        column.name
                    );
                }
                true
            }
            SchemaChange::AddColumn { column, .. } => match snapshot.column(&column.name) {
                Some(existing) => {
                    if existing.data_type != column.column_type.catalog_name() {
                        log::warn!(
                            "column {}.{} exists as '{}', expected '{}'",
                            snapshot.table(),
                            column.name,
                            existing.data_type,
                            column.column_type.catalog_name()
                        );
                    }
                    true
                }
                None => false,
            },
            SchemaChange::DropColumn { column, .. } => !snapshot.has_column(column),
            SchemaChange::CreateIndex { index, .. } => snapshot.has_index(&index.name),
            SchemaChange::Backfill { table, column, .. } => {
                snapshot.has_column(column) && remaining_nulls(executor, table, column)? == 0
            }
            SchemaChange::AddConstraint { name, kind, .. } => {
                if snapshot.has_constraint(name) {
                    true
                } else if let (ConstraintKind::PrimaryKey(_), Some(existing)) =
                    (kind, snapshot.primary_key())
                {
                    // A table holds a single primary key, whatever its name
                    log::warn!(
                        "{} already has primary key '{}'; not adding '{name}'",
                        snapshot.table(),
                        existing.name
                    );
                    true
                } else {
                    false
                }
            }
            SchemaChange::EnableRowLevelSecurity { .. } => snapshot.rls_enabled(),
            SchemaChange::CreatePolicy { policy, .. } => snapshot.has_policy(&policy.name),
        })
    }

    /// Reject identifiers that cannot be rendered safely
    pub fn validate(&self) -> Result<(), String> {
        let table = self.table();
        check_identifier("table", table.name())?;
        check_identifier("schema", table.schema())?;
        match self {
            SchemaChange::CreateTable { columns, .. } => {
                if columns.is_empty() {
                    return Err(format!("table '{table}' has no columns"));
                }
                for (idx, column) in columns.iter().enumerate() {
                    check_identifier("column", &column.name)?;
                    if columns[..idx].iter().any(|c| c.name == column.name) {
                        return Err(format!("duplicate column '{}'", column.name));
                    }
                }
                if columns.iter().filter(|c| c.primary_key).count() > 1 {
                    return Err(format!("table '{table}' has more than one primary key column"));
                }
                Ok(())
            }
            SchemaChange::AddColumn { column, .. } => check_identifier("column", &column.name),
            SchemaChange::DropColumn { column, .. } | SchemaChange::Backfill { column, .. } => {
                check_identifier("column", column)
            }
            SchemaChange::CreateIndex { index, .. } => {
                check_identifier("index", &index.name)?;
                if index.columns.is_empty() {
                    return Err(format!("index '{}' has no columns", index.name));
                }
                index
                    .columns
                    .iter()
                    .try_for_each(|c| check_identifier("column", c))
            }
            SchemaChange::AddConstraint { name, kind, .. } => {
                check_identifier("constraint", name)?;
                if matches!(kind, ConstraintKind::PrimaryKey(c) | ConstraintKind::Unique(c) if c.is_empty())
                {
                    return Err(format!("constraint '{name}' has no columns"));
                }
                kind.columns()
                    .iter()
                    .try_for_each(|c| check_identifier("column", c))
            }
            SchemaChange::EnableRowLevelSecurity { .. } => Ok(()),
            SchemaChange::CreatePolicy { policy, .. } => policy.validate(),
        }
    }
}

fn check_identifier(what: &str, name: &str) -> Result<(), String> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(format!("invalid {what} name '{name}'"))
    }
}

/// `Users can see rows` -> `users_can_see_rows`
fn slug(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

fn sea_table(table: &TableName) -> sea_query::TableName {
    let schema = (!table.is_default_schema())
        .then(|| SchemaName::from(table.schema().to_string()));
    sea_query::TableName(schema, table.name().to_string().into_iden())
}

fn remaining_nulls(
    executor: &dyn SqlExecutor,
    table: &TableName,
    column: &str,
) -> Result<i64, ExecError> {
    let sql = format!(
        "SELECT COUNT(*)::text AS remaining FROM {} WHERE {} IS NULL",
        table.quoted(),
        quote_ident(column)
    );
    executor
        .query_all(&sql)?
        .first()
        .and_then(|row| row.get_i64("remaining"))
        .ok_or_else(|| ExecError::Parse(format!("no row count returned for {table}.{column}")))
}

/// A `SchemaChange` under a step name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeStep {
    name: String,
    change: SchemaChange,
}

impl ChangeStep {
    pub fn new(change: SchemaChange) -> Self {
        Self {
            name: change.default_name(),
            change,
        }
    }

    pub fn named(name: impl Into<String>, change: SchemaChange) -> Self {
        Self {
            name: name.into(),
            change,
        }
    }

    pub fn change(&self) -> &SchemaChange {
        &self.change
    }
}

impl From<SchemaChange> for ChangeStep {
    fn from(change: SchemaChange) -> Self {
        Self::new(change)
    }
}

impl MigrationStep for ChangeStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &TableName {
        self.change.table()
    }

    fn is_applied(
        &self,
        snapshot: &SchemaSnapshot,
        executor: &dyn SqlExecutor,
    ) -> Result<bool, ExecError> {
        self.change.is_applied(snapshot, executor)
    }

    fn apply(&self, executor: &dyn SqlExecutor) -> Result<(), ExecError> {
        for sql in self.change.forward_sql() {
            let affected = executor.execute(&sql)?;
            log::debug!("{}: {affected} row(s) affected", self.name);
        }
        Ok(())
    }

    fn manual_sql(&self) -> String {
        self.change.manual_sql()
    }

    fn validate(&self) -> Result<(), String> {
        self.change.validate()
    }
}
