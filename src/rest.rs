//! `RestExecutor` - runs SQL through a hosted backend's SQL RPC endpoint.
//!
//! Hosted PostgreSQL backends expose stored functions over PostgREST at
//! `<url>/rest/v1/rpc/<function>`. Schema changes go through a
//! service-role-only function such as `exec_sql(sql text)`. Projects differ in
//! which function they installed, so the executor tries the primary function
//! first and switches to the fallback when PostgREST reports the primary one
//! missing.

use crate::executor::{ExecError, Row, SqlExecutor};
use serde::Deserialize;
use serde_json::Value;
use std::cell::Cell;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// PostgREST code for "function not found in the schema cache"
const FUNCTION_NOT_FOUND: &str = "PGRST202";

/// A SQL-executing RPC function and the name of its single text argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFunction {
    pub name: String,
    pub argument: String,
}

impl RpcFunction {
    pub fn new(name: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument: argument.into(),
        }
    }
}

/// PostgREST error body
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl ErrorBody {
    fn into_error(self, status: u16) -> ExecError {
        let mut message = self.message.unwrap_or_else(|| format!("HTTP {status}"));
        if let Some(details) = self.details.filter(|d| !d.is_empty()) {
            message.push_str(&format!(" ({details})"));
        }
        if let Some(hint) = self.hint.filter(|h| !h.is_empty()) {
            message.push_str(&format!(" hint: {hint}"));
        }
        match status {
            401 | 403 => ExecError::Connection(format!("not authorized: {message}")),
            404 if self.code.is_none() => ExecError::rejected(FUNCTION_NOT_FOUND, message),
            _ => ExecError::Rejected {
                code: self.code,
                message,
            },
        }
    }
}

/// Implementation of `SqlExecutor` over a PostgREST SQL RPC function
pub struct RestExecutor {
    agent: ureq::Agent,
    base_url: String,
    service_key: String,
    primary: RpcFunction,
    fallback: Option<RpcFunction>,
    use_fallback: Cell<bool>,
    timeout: Cell<Option<Duration>>,
}

impl RestExecutor {
    /// Create an executor for `base_url` (e.g. `https://<project>.supabase.co`)
    /// authenticated with a service-role key. Uses `exec_sql(sql)` with an
    /// `execute_sql(query)` fallback.
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            primary: RpcFunction::new("exec_sql", "sql"),
            fallback: Some(RpcFunction::new("execute_sql", "query")),
            use_fallback: Cell::new(false),
            timeout: Cell::new(None),
        }
    }

    pub fn with_primary(mut self, function: RpcFunction) -> Self {
        self.primary = function;
        self
    }

    pub fn with_fallback(mut self, function: Option<RpcFunction>) -> Self {
        self.fallback = function;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint URL for an RPC function
    pub fn rpc_url(&self, function: &RpcFunction) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function.name)
    }

    fn active_function(&self) -> &RpcFunction {
        match (&self.fallback, self.use_fallback.get()) {
            (Some(fallback), true) => fallback,
            _ => &self.primary,
        }
    }

    /// Call the active RPC function, switching to the fallback once if the
    /// primary is not installed.
    fn call(&self, sql: &str) -> Result<Value, ExecError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        let start = Instant::now();
        let result = match self.call_function(self.active_function(), sql) {
            Err(ExecError::Rejected { code, message })
                if !self.use_fallback.get()
                    && self.fallback.is_some()
                    && code.as_deref() == Some(FUNCTION_NOT_FOUND) =>
            {
                let fallback = self.fallback.as_ref().map(|f| f.name.as_str()).unwrap_or_default();
                log::warn!(
                    "RPC function '{}' unavailable ({message}); retrying through '{fallback}'",
                    self.primary.name
                );
                self.use_fallback.set(true);
                self.call_function(self.active_function(), sql)
            }
            other => other,
        };

        #[cfg(feature = "metrics")]
        METRICS.record_statement(start.elapsed(), result.is_err());
        log::trace!("rpc call finished in {:?}", start.elapsed());
        result
    }

    fn call_function(&self, function: &RpcFunction, sql: &str) -> Result<Value, ExecError> {
        log::debug!("rpc {}: {sql}", function.name);
        let mut request = self
            .agent
            .post(&self.rpc_url(function))
            .set("apikey", &self.service_key)
            .set("Authorization", &format!("Bearer {}", self.service_key))
            .set("Content-Type", "application/json")
            .set("Accept", "application/json");
        if let Some(timeout) = self.timeout.get() {
            request = request.timeout(timeout);
        }

        let mut body = serde_json::Map::new();
        body.insert(function.argument.clone(), Value::String(sql.to_string()));

        match request.send_json(Value::Object(body)) {
            Ok(response) => {
                let text = response
                    .into_string()
                    .map_err(|e| ExecError::Parse(format!("unreadable RPC response: {e}")))?;
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&text)
                    .map_err(|e| ExecError::Parse(format!("RPC response is not JSON: {e}")))
            }
            Err(ureq::Error::Status(status, response)) => {
                let text = response.into_string().unwrap_or_default();
                Err(Self::status_error(status, &text))
            }
            Err(ureq::Error::Transport(transport)) => Err(Self::transport_error(&transport)),
        }
    }

    fn status_error(status: u16, body: &str) -> ExecError {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => parsed.into_error(status),
            Err(_) if status == 404 => ExecError::rejected(FUNCTION_NOT_FOUND, format!("HTTP 404: {body}")),
            Err(_) if status == 401 || status == 403 => {
                ExecError::Connection(format!("not authorized (HTTP {status})"))
            }
            Err(_) => ExecError::Rejected {
                code: None,
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    fn transport_error(transport: &ureq::Transport) -> ExecError {
        let mut source = std::error::Error::source(transport);
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) {
                    return ExecError::Timeout(transport.to_string());
                }
            }
            source = err.source();
        }
        ExecError::Connection(transport.to_string())
    }

    /// Convert an RPC payload into rows. Functions returning `SETOF json`
    /// answer with an array of objects, `[]` when nothing matched.
    ///
    /// A `null` or scalar payload comes from a function that does not return
    /// rows (e.g. `RETURNS void`); treating it as empty would make every
    /// catalog read look like a missing table.
    pub fn rows_from_payload(payload: Value) -> Result<Vec<Row>, ExecError> {
        match payload {
            Value::Array(items) => Ok(items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => map.into_iter().collect(),
                    other => [("value", other)].into_iter().collect(),
                })
                .collect()),
            Value::Object(map) => Ok(vec![map.into_iter().collect()]),
            other => Err(ExecError::Parse(format!(
                "RPC function returned no result set ({other}); it must return json rows"
            ))),
        }
    }
}

impl SqlExecutor for RestExecutor {
    fn execute(&self, sql: &str) -> Result<u64, ExecError> {
        let payload = self.call(sql)?;
        Ok(match payload {
            Value::Array(items) => items.len() as u64,
            Value::Number(n) => n.as_u64().unwrap_or(0),
            _ => 0,
        })
    }

    fn query_all(&self, sql: &str) -> Result<Vec<Row>, ExecError> {
        self.call(sql).and_then(Self::rows_from_payload)
    }

    fn check_connection(&self) -> Result<(), ExecError> {
        if self.service_key.trim().is_empty() {
            return Err(ExecError::Connection(
                "service key is empty; an administrative credential is required".to_string(),
            ));
        }
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(ExecError::Connection(format!(
                "'{}' is not an http(s) endpoint",
                self.base_url
            )));
        }
        if self.query_all("SELECT 1 AS ok")?.is_empty() {
            return Err(ExecError::Parse(
                "RPC function returned no rows for SELECT 1".to_string(),
            ));
        }
        Ok(())
    }

    fn set_statement_timeout(&self, timeout: Option<Duration>) -> Result<(), ExecError> {
        self.timeout.set(timeout);
        Ok(())
    }
}

impl std::fmt::Debug for RestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestExecutor")
            .field("base_url", &self.base_url)
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}
