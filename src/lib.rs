//! # Tidemark
//!
//! Idempotent, verifiable schema migrations for PostgreSQL, run either over a
//! direct `may_postgres` connection or through a hosted backend's SQL RPC.
//!
//! A migration is a [`migration::MigrationPlan`]: an ordered list of steps,
//! each knowing how to check whether it is already applied. The
//! [`migration::Runner`] checks, applies, re-checks, and reports
//! `Applied`, `AlreadyApplied` or `Failed` per step, so a plan can be run
//! any number of times.

pub mod config;
pub mod connection;
pub mod executor;
pub mod metrics;
pub mod migration;
pub mod rest;

pub use config::{Backend, DatabaseConfig};
pub use connection::{connect, connect_postgres, ConnectionError};
pub use executor::{ExecError, PostgresExecutor, Row, SqlExecutor};
pub use migration::{MigrationError, MigrationPlan, RunReport, Runner, StepOutcome};
pub use rest::{RestExecutor, RpcFunction};
