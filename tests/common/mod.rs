//! In-memory stand-in for a PostgreSQL database
//!
//! Understands the statements and catalog queries tidemark emits, answers
//! with the SQLSTATE codes Postgres would use, logs every statement and
//! supports fault injection by SQL substring. Tables outside `public` are
//! keyed by their qualified name, e.g. `billing.invoices`.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::Duration;
use tidemark::{ExecError, Row, SqlExecutor};

/// A table reference as rendered: `"t"` or `"schema"."t"`
const TABLE_REF: &str = r#"((?:"\w+"\.)?"\w+")"#;

fn statement(pattern: &str) -> Regex {
    Regex::new(&pattern.replace("{table}", TABLE_REF)).unwrap()
}

static CREATE_TABLE: Lazy<Regex> =
    Lazy::new(|| statement(r"(?is)^CREATE TABLE {table} \((.*)\)$"));
static ADD_COLUMN: Lazy<Regex> =
    Lazy::new(|| statement(r#"(?i)^ALTER TABLE {table} ADD COLUMN "(\w+)" ?(.*)$"#));
static DROP_COLUMN: Lazy<Regex> =
    Lazy::new(|| statement(r#"(?i)^ALTER TABLE {table} DROP COLUMN "(\w+)"$"#));
static CREATE_INDEX: Lazy<Regex> =
    Lazy::new(|| statement(r#"(?i)^CREATE (UNIQUE )?INDEX "(\w+)" ON {table} (.*)$"#));
static BACKFILL: Lazy<Regex> = Lazy::new(|| {
    statement(r#"(?i)^UPDATE {table} SET "(\w+)" = '((?:[^']|'')*)' WHERE "(\w+)" IS NULL$"#)
});
static ADD_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    statement(r#"(?i)^ALTER TABLE {table} ADD CONSTRAINT "(\w+)" (PRIMARY KEY|UNIQUE|CHECK) \((.*)\)$"#)
});
static ENABLE_RLS: Lazy<Regex> =
    Lazy::new(|| statement(r"(?i)^ALTER TABLE {table} ENABLE ROW LEVEL SECURITY$"));
static CREATE_POLICY: Lazy<Regex> = Lazy::new(|| {
    statement(r#"(?is)^CREATE POLICY "((?:[^"]|"")+)" ON {table} FOR (ALL|SELECT|INSERT|UPDATE|DELETE)\b"#)
});
static COUNT_NULLS: Lazy<Regex> = Lazy::new(|| {
    statement(r#"(?i)^SELECT COUNT\(\*\)::text AS remaining FROM {table} WHERE "(\w+)" IS NULL$"#)
});
static CATALOG_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:relname|table_name|tablename) = '(\w+)'").unwrap());
static CATALOG_SCHEMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:nspname|table_schema|schemaname) = '(\w+)'").unwrap());
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""(\w+)""#).unwrap());

/// `"billing"."invoices"` -> `billing.invoices`, `"public"."t"` -> `t`
fn table_key(reference: &str) -> String {
    let parts: Vec<&str> = reference.split('.').map(|p| p.trim_matches('"')).collect();
    match parts.as_slice() {
        [schema, name] => qualified(schema, name),
        _ => reference.trim_matches('"').to_string(),
    }
}

fn qualified(schema: &str, name: &str) -> String {
    if schema == "public" {
        name.to_string()
    } else {
        format!("{schema}.{name}")
    }
}

/// Split a column list on commas outside parentheses
fn split_definitions(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let (mut depth, mut current) = (0i32, String::new());
    for ch in body.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Column attributes from the text following the column name
fn parse_column(name: &str, rest: &str) -> Column {
    let upper = rest.to_ascii_uppercase();
    let default = upper.find("DEFAULT ").map(|idx| {
        let tail = &rest[idx + 8..];
        let tail_upper = &upper[idx + 8..];
        let end = [" NOT NULL", " NULL", " PRIMARY KEY", " REFERENCES"]
            .iter()
            .filter_map(|marker| tail_upper.find(marker))
            .min()
            .unwrap_or(tail.len());
        tail[..end].trim().to_string()
    });
    Column {
        name: name.to_string(),
        data_type: catalog_type(rest),
        nullable: !upper.contains("NOT NULL") && !upper.contains("PRIMARY KEY"),
        default,
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<BTreeMap<String, Option<String>>>,
    pub indexes: Vec<(String, String)>,
    pub constraints: Vec<(String, String)>,
    /// (name, command)
    pub policies: Vec<(String, String)>,
    pub rls: bool,
}

impl Table {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

#[derive(Debug, Clone)]
enum Fault {
    Rejected { code: Option<String>, message: String },
    Connection(String),
    Timeout(String),
    Delay(Duration),
}

pub struct MemoryDatabase {
    tables: RefCell<BTreeMap<String, Table>>,
    credential: String,
    send_sqlstate: bool,
    faults: RefCell<Vec<(String, Fault)>>,
    statements: RefCell<Vec<String>>,
    mutations: RefCell<Vec<String>>,
    timeouts: RefCell<Vec<Option<Duration>>>,
    uuid_seq: Cell<u64>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            tables: RefCell::new(BTreeMap::new()),
            credential: "service-role-key".to_string(),
            send_sqlstate: true,
            faults: RefCell::new(Vec::new()),
            statements: RefCell::new(Vec::new()),
            mutations: RefCell::new(Vec::new()),
            timeouts: RefCell::new(Vec::new()),
            uuid_seq: Cell::new(0),
        }
    }

    pub fn with_credential(mut self, credential: &str) -> Self {
        self.credential = credential.to_string();
        self
    }

    /// Report errors by message only, as some RPC endpoints do
    pub fn without_sqlstate(mut self) -> Self {
        self.send_sqlstate = false;
        self
    }

    pub fn with_table(self, name: &str, columns: &[(&str, &str)]) -> Self {
        let table = Table {
            columns: columns
                .iter()
                .map(|(n, t)| Column {
                    name: n.to_string(),
                    data_type: t.to_string(),
                    nullable: true,
                    default: None,
                })
                .collect(),
            ..Table::default()
        };
        self.tables.borrow_mut().insert(name.to_string(), table);
        self
    }

    pub fn insert_row(&self, table: &str, values: &[(&str, Option<&str>)]) {
        let mut tables = self.tables.borrow_mut();
        let table = tables.get_mut(table).expect("table exists");
        let row = table
            .columns
            .iter()
            .map(|c| {
                let value = values
                    .iter()
                    .find(|(n, _)| *n == c.name)
                    .and_then(|(_, v)| v.map(str::to_string));
                (c.name.clone(), value)
            })
            .collect();
        table.rows.push(row);
    }

    pub fn add_index(&self, table: &str, name: &str) {
        let mut tables = self.tables.borrow_mut();
        let table = tables.get_mut(table).expect("table exists");
        table.indexes.push((name.to_string(), format!("CREATE INDEX {name}")));
    }

    /// Fail every statement containing `pattern` with a database error
    pub fn fail_on(&self, pattern: &str, code: &str, message: &str) {
        self.faults.borrow_mut().push((
            pattern.to_string(),
            Fault::Rejected {
                code: Some(code.to_string()),
                message: message.to_string(),
            },
        ));
    }

    pub fn drop_connection_on(&self, pattern: &str) {
        self.faults
            .borrow_mut()
            .push((pattern.to_string(), Fault::Connection("connection reset by peer".into())));
    }

    pub fn time_out_on(&self, pattern: &str) {
        self.faults
            .borrow_mut()
            .push((pattern.to_string(), Fault::Timeout("request timed out".into())));
    }

    /// Sleep before running statements containing `pattern`
    pub fn delay_on(&self, pattern: &str, delay: Duration) {
        self.faults.borrow_mut().push((pattern.to_string(), Fault::Delay(delay)));
    }

    pub fn clear_faults(&self) {
        self.faults.borrow_mut().clear();
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.tables.borrow().get(name).cloned()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table).map(|t| t.has_column(column)).unwrap_or(false)
    }

    pub fn has_index(&self, table: &str, index: &str) -> bool {
        self.table(table)
            .map(|t| t.indexes.iter().any(|(n, _)| n == index))
            .unwrap_or(false)
    }

    pub fn has_constraint(&self, table: &str, constraint: &str) -> bool {
        self.table(table)
            .map(|t| t.constraints.iter().any(|(n, _)| n == constraint))
            .unwrap_or(false)
    }

    pub fn has_policy(&self, table: &str, policy: &str) -> bool {
        self.table(table)
            .map(|t| t.policies.iter().any(|(n, _)| n == policy))
            .unwrap_or(false)
    }

    pub fn rls_enabled(&self, table: &str) -> bool {
        self.table(table).map(|t| t.rls).unwrap_or(false)
    }

    pub fn column_values(&self, table: &str, column: &str) -> Vec<Option<String>> {
        self.table(table)
            .map(|t| t.rows.iter().map(|r| r.get(column).cloned().flatten()).collect())
            .unwrap_or_default()
    }

    /// Every statement received, reads included
    pub fn statements(&self) -> Vec<String> {
        self.statements.borrow().clone()
    }

    /// Statements that changed schema or data
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.borrow().clone()
    }

    pub fn timeouts(&self) -> Vec<Option<Duration>> {
        self.timeouts.borrow().clone()
    }

    fn error(&self, code: &str, message: String) -> ExecError {
        ExecError::Rejected {
            code: self.send_sqlstate.then(|| code.to_string()),
            message,
        }
    }

    fn inject_faults(&self, sql: &str) -> Result<(), ExecError> {
        let faults: Vec<Fault> = self
            .faults
            .borrow()
            .iter()
            .filter(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, fault)| fault.clone())
            .collect();
        for fault in faults {
            match fault {
                Fault::Delay(delay) => std::thread::sleep(delay),
                Fault::Rejected { code, message } => {
                    return Err(ExecError::Rejected {
                        code: code.filter(|_| self.send_sqlstate),
                        message,
                    })
                }
                Fault::Connection(message) => return Err(ExecError::Connection(message)),
                Fault::Timeout(message) => return Err(ExecError::Timeout(message)),
            }
        }
        Ok(())
    }

    fn missing_table(&self, table: &str) -> ExecError {
        self.error("42P01", format!("relation \"{table}\" does not exist"))
    }

    fn generated_value(&self, default: &str) -> String {
        if default.contains("gen_random_uuid") {
            self.uuid_seq.set(self.uuid_seq.get() + 1);
            format!("00000000-0000-4000-8000-{:012}", self.uuid_seq.get())
        } else {
            default.trim_matches('\'').to_string()
        }
    }

    fn apply(&self, sql: &str) -> Result<u64, ExecError> {
        let mut tables = self.tables.borrow_mut();

        if let Some(caps) = CREATE_TABLE.captures(sql) {
            let table_name = table_key(&caps[1]);
            if tables.contains_key(&table_name) {
                return Err(self.error("42P07", format!("relation \"{table_name}\" already exists")));
            }
            let mut table = Table::default();
            for definition in split_definitions(&caps[2]) {
                let Some((name, rest)) = definition.split_once(' ') else {
                    return Err(self.error("42601", format!("syntax error at \"{definition}\"")));
                };
                let column = parse_column(name.trim_matches('"'), rest);
                if rest.to_ascii_uppercase().contains("PRIMARY KEY") {
                    let pkey = format!("{}_pkey", table_name.rsplit('.').next().unwrap_or_default());
                    table.indexes.push((pkey.clone(), definition.clone()));
                    table.constraints.push((pkey, "PRIMARY KEY".to_string()));
                }
                table.columns.push(column);
            }
            tables.insert(table_name, table);
            return Ok(0);
        }

        if let Some(caps) = ADD_COLUMN.captures(sql) {
            let (table_name, column, rest) = (table_key(&caps[1]), &caps[2], &caps[3]);
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| self.missing_table(&table_name))?;
            if table.has_column(column) {
                return Err(self.error(
                    "42701",
                    format!("column \"{column}\" of relation \"{table_name}\" already exists"),
                ));
            }
            let added = parse_column(column, rest);
            if !added.nullable && added.default.is_none() && !table.rows.is_empty() {
                return Err(self.error(
                    "23502",
                    format!("column \"{column}\" of relation \"{table_name}\" contains null values"),
                ));
            }
            for row in &mut table.rows {
                let value = added.default.as_deref().map(|d| self.generated_value(d));
                row.insert(column.to_string(), value);
            }
            table.columns.push(added);
            return Ok(0);
        }

        if let Some(caps) = DROP_COLUMN.captures(sql) {
            let (table_name, column) = (table_key(&caps[1]), &caps[2]);
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| self.missing_table(&table_name))?;
            if !table.has_column(column) {
                return Err(self.error(
                    "42703",
                    format!("column \"{column}\" of relation \"{table_name}\" does not exist"),
                ));
            }
            table.columns.retain(|c| c.name != column);
            for row in &mut table.rows {
                row.remove(column);
            }
            return Ok(0);
        }

        if let Some(caps) = CREATE_INDEX.captures(sql) {
            let (index, table_name, rest) = (&caps[2], table_key(&caps[3]), &caps[4]);
            if tables
                .values()
                .any(|t| t.indexes.iter().any(|(n, _)| n == index))
            {
                return Err(self.error("42P07", format!("relation \"{index}\" already exists")));
            }
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| self.missing_table(&table_name))?;
            let columns_part = rest.split(" WHERE ").next().unwrap_or_default();
            for col in QUOTED.captures_iter(columns_part) {
                if !table.has_column(&col[1]) {
                    return Err(self.error("42703", format!("column \"{}\" does not exist", &col[1])));
                }
            }
            table.indexes.push((index.to_string(), sql.to_string()));
            return Ok(0);
        }

        if let Some(caps) = BACKFILL.captures(sql) {
            let (table_name, column, value) = (table_key(&caps[1]), &caps[2], caps[3].replace("''", "'"));
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| self.missing_table(&table_name))?;
            if !table.has_column(column) {
                return Err(self.error("42703", format!("column \"{column}\" does not exist")));
            }
            let mut updated = 0;
            for row in &mut table.rows {
                let slot = row.entry(column.to_string()).or_insert(None);
                if slot.is_none() {
                    *slot = Some(value.clone());
                    updated += 1;
                }
            }
            return Ok(updated);
        }

        if let Some(caps) = ADD_CONSTRAINT.captures(sql) {
            let (table_name, name, kind, body) =
                (table_key(&caps[1]), &caps[2], caps[3].to_ascii_uppercase(), &caps[4]);
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| self.missing_table(&table_name))?;
            if table.constraints.iter().any(|(n, _)| n == name) {
                return Err(self.error(
                    "42710",
                    format!("constraint \"{name}\" for relation \"{table_name}\" already exists"),
                ));
            }
            if kind == "PRIMARY KEY" && table.constraints.iter().any(|(_, k)| k == "PRIMARY KEY") {
                return Err(self.error(
                    "42P16",
                    format!("multiple primary keys for table \"{table_name}\" are not allowed"),
                ));
            }
            if kind != "CHECK" {
                for col in QUOTED.captures_iter(body) {
                    if !table.has_column(&col[1]) {
                        return Err(self.error("42703", format!("column \"{}\" does not exist", &col[1])));
                    }
                }
                table.indexes.push((name.to_string(), sql.to_string()));
            }
            table.constraints.push((name.to_string(), kind));
            return Ok(0);
        }

        if let Some(caps) = ENABLE_RLS.captures(sql) {
            let table_name = table_key(&caps[1]);
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| self.missing_table(&table_name))?;
            table.rls = true;
            return Ok(0);
        }

        if let Some(caps) = CREATE_POLICY.captures(sql) {
            let (name, table_name, command) =
                (caps[1].replace("\"\"", "\""), table_key(&caps[2]), caps[3].to_ascii_uppercase());
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| self.missing_table(&table_name))?;
            if table.policies.iter().any(|(n, _)| *n == name) {
                return Err(self.error(
                    "42710",
                    format!("policy \"{name}\" for table \"{table_name}\" already exists"),
                ));
            }
            table.policies.push((name, command));
            return Ok(0);
        }

        Err(self.error("42601", format!("syntax error in \"{sql}\"")))
    }

    fn read(&self, sql: &str) -> Result<Vec<Row>, ExecError> {
        let tables = self.tables.borrow();

        if sql.trim() == "SELECT 1 AS ok" {
            return Ok(vec![[("ok", json!(1))].into_iter().collect()]);
        }

        if let Some(caps) = COUNT_NULLS.captures(sql) {
            let (table_name, column) = (table_key(&caps[1]), &caps[2]);
            let table = tables.get(&table_name).ok_or_else(|| self.missing_table(&table_name))?;
            if !table.has_column(column) {
                return Err(self.error("42703", format!("column \"{column}\" does not exist")));
            }
            let remaining = table
                .rows
                .iter()
                .filter(|r| r.get(column).cloned().flatten().is_none())
                .count();
            return Ok(vec![[("remaining", json!(remaining.to_string()))].into_iter().collect()]);
        }

        let Some(table_name) = CATALOG_TABLE.captures(sql).map(|c| c[1].to_string()) else {
            return Err(self.error("42601", format!("unsupported query \"{sql}\"")));
        };
        let schema = CATALOG_SCHEMA
            .captures(sql)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "public".to_string());
        let Some(table) = tables.get(&qualified(&schema, &table_name)) else {
            return Ok(Vec::new());
        };

        if sql.contains("FROM pg_class") {
            return Ok(vec![[
                ("table_name", json!(table_name)),
                ("rls_enabled", json!(table.rls.to_string())),
            ]
            .into_iter()
            .collect()]);
        }
        if sql.contains("FROM information_schema.columns") {
            return Ok(table
                .columns
                .iter()
                .map(|c| {
                    [
                        ("column_name", json!(c.name)),
                        ("data_type", json!(c.data_type)),
                        ("is_nullable", json!(if c.nullable { "YES" } else { "NO" })),
                        ("column_default", c.default.clone().map(Value::String).unwrap_or(Value::Null)),
                    ]
                    .into_iter()
                    .collect()
                })
                .collect());
        }
        if sql.contains("FROM pg_indexes") {
            return Ok(table
                .indexes
                .iter()
                .map(|(name, def)| {
                    [("index_name", json!(name)), ("index_def", json!(def))]
                        .into_iter()
                        .collect()
                })
                .collect());
        }
        if sql.contains("FROM information_schema.table_constraints") {
            return Ok(table
                .constraints
                .iter()
                .map(|(name, kind)| {
                    [("constraint_name", json!(name)), ("constraint_type", json!(kind))]
                        .into_iter()
                        .collect()
                })
                .collect());
        }
        if sql.contains("FROM pg_policies") {
            return Ok(table
                .policies
                .iter()
                .map(|(name, command)| {
                    [("policy_name", json!(name)), ("command", json!(command))]
                        .into_iter()
                        .collect()
                })
                .collect());
        }
        Err(self.error("42601", format!("unsupported query \"{sql}\"")))
    }
}

fn catalog_type(definition: &str) -> String {
    let lower = definition.to_ascii_lowercase();
    let kind = if lower.starts_with("varchar") || lower.starts_with("character varying") {
        "character varying"
    } else if lower.starts_with("uuid") {
        "uuid"
    } else if lower.starts_with("decimal") || lower.starts_with("numeric") {
        "numeric"
    } else if lower.starts_with("bigint") {
        "bigint"
    } else if lower.starts_with("integer") {
        "integer"
    } else if lower.starts_with("bool") {
        "boolean"
    } else if lower.starts_with("timestamp with time zone") {
        "timestamp with time zone"
    } else {
        "text"
    };
    kind.to_string()
}

impl SqlExecutor for MemoryDatabase {
    fn execute(&self, sql: &str) -> Result<u64, ExecError> {
        self.statements.borrow_mut().push(sql.to_string());
        self.inject_faults(sql)?;
        let affected = self.apply(sql)?;
        self.mutations.borrow_mut().push(sql.to_string());
        Ok(affected)
    }

    fn query_all(&self, sql: &str) -> Result<Vec<Row>, ExecError> {
        self.statements.borrow_mut().push(sql.to_string());
        self.inject_faults(sql)?;
        self.read(sql)
    }

    fn check_connection(&self) -> Result<(), ExecError> {
        if self.credential.trim().is_empty() {
            return Err(ExecError::Connection(
                "service key is empty; an administrative credential is required".to_string(),
            ));
        }
        self.query_all("SELECT 1 AS ok").map(|_| ())
    }

    fn set_statement_timeout(&self, timeout: Option<Duration>) -> Result<(), ExecError> {
        self.timeouts.borrow_mut().push(timeout);
        Ok(())
    }
}

/// `transactions` table as it looked before the file_source migration
pub fn transactions_db() -> MemoryDatabase {
    let db = MemoryDatabase::new().with_table(
        "transactions",
        &[("id", "uuid"), ("amount", "numeric"), ("description", "text")],
    );
    db.insert_row("transactions", &[("id", Some("t1")), ("amount", Some("12.50"))]);
    db.insert_row("transactions", &[("id", Some("t2")), ("amount", Some("3.99"))]);
    db.insert_row("transactions", &[("id", Some("t3")), ("amount", Some("100.00"))]);
    db
}
