//! Classification of step failures
//!
//! The SQLSTATE decides whenever the backend reports one. The message is
//! inspected only for errors that arrive without a code.

use crate::executor::ExecError;

/// How the runner treats a failed forward action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Duplicate column, relation, object or schema
    AlreadyExists,
    /// Undefined column, table or object the step relies on
    MissingDependency,
    /// Statement canceled or request timed out
    Timeout,
    /// Connection dropped or credential rejected
    Connection,
    Other,
}

impl ErrorClass {
    pub fn of(err: &ExecError) -> Self {
        match err {
            ExecError::Connection(_) => return ErrorClass::Connection,
            ExecError::Timeout(_) => return ErrorClass::Timeout,
            ExecError::Parse(_) => return ErrorClass::Other,
            ExecError::Postgres(_) | ExecError::Rejected { .. } => {}
        }
        match err.sqlstate() {
            Some(code) => Self::from_sqlstate(code),
            None => Self::from_message(&err.to_string()),
        }
    }

    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "42701" | "42P07" | "42710" | "42P06" => ErrorClass::AlreadyExists,
            "42703" | "42P01" | "42704" => ErrorClass::MissingDependency,
            "57014" => ErrorClass::Timeout,
            c if c.starts_with("08") || c.starts_with("28") => ErrorClass::Connection,
            _ => ErrorClass::Other,
        }
    }

    /// Last resort for errors without a SQLSTATE
    pub fn from_message(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        if message.contains("already exists") {
            ErrorClass::AlreadyExists
        } else if message.contains("does not exist") {
            ErrorClass::MissingDependency
        } else if message.contains("statement timeout") || message.contains("timed out") {
            ErrorClass::Timeout
        } else if message.contains("connection closed")
            || message.contains("connection refused")
            || message.contains("connection reset")
        {
            ErrorClass::Connection
        } else {
            ErrorClass::Other
        }
    }
}
