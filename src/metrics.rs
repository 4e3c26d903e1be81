//! Metrics and tracing instrumentation.
//!
//! With the `metrics` feature, step and statement counters are exported
//! through OpenTelemetry's Prometheus exporter into a registry that
//! [`render_prometheus`] dumps in the text exposition format. With the
//! `tracing` feature, runs, steps, statements and connects open `tracing`
//! spans.

#[cfg(feature = "metrics")]
pub use otel::{TidemarkMetrics, METRICS};

/// Everything recorded so far, in Prometheus text format.
///
/// `None` when built without the `metrics` feature or when the exporter
/// could not be set up.
pub fn render_prometheus() -> Option<String> {
    #[cfg(feature = "metrics")]
    {
        METRICS.gather()
    }
    #[cfg(not(feature = "metrics"))]
    {
        None
    }
}

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, Meter, MeterProvider},
        KeyValue,
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<TidemarkMetrics> = Lazy::new(TidemarkMetrics::init);

    pub struct TidemarkMetrics {
        /// Registry the exporter writes into; `None` if it failed to build
        pub registry: Option<Registry>,
        pub provider: Option<SdkMeterProvider>,
        pub steps_total: Counter<u64>,
        pub step_duration: Histogram<f64>,
        pub statements_total: Counter<u64>,
        pub statement_errors_total: Counter<u64>,
        pub statement_duration: Histogram<f64>,
    }

    impl TidemarkMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let (registry, provider) = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => {
                    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
                    (Some(registry), Some(provider))
                }
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics are not exported: {e}");
                    (None, None)
                }
            };
            let meter: Meter = match &provider {
                Some(provider) => provider.meter("tidemark"),
                None => global::meter("tidemark"),
            };

            let steps_total = meter
                .u64_counter("tidemark_steps_total")
                .with_description("Migration steps processed, by outcome")
                .build();

            let step_duration = meter
                .f64_histogram("tidemark_step_duration_seconds")
                .with_description("Duration of migration steps")
                .build();

            let statements_total = meter
                .u64_counter("tidemark_statements_total")
                .with_description("Total statements sent to the database")
                .build();

            let statement_errors_total = meter
                .u64_counter("tidemark_statement_errors_total")
                .with_description("Statements the database rejected")
                .build();

            let statement_duration = meter
                .f64_histogram("tidemark_statement_duration_seconds")
                .with_description("Duration of statements")
                .build();

            Self {
                registry,
                provider,
                steps_total,
                step_duration,
                statements_total,
                statement_errors_total,
                statement_duration,
            }
        }

        pub fn record_statement(&self, elapsed: Duration, failed: bool) {
            self.statements_total.add(1, &[]);
            if failed {
                self.statement_errors_total.add(1, &[]);
            }
            self.statement_duration.record(elapsed.as_secs_f64(), &[]);
        }

        /// `outcome` is `applied`, `already_applied` or `failed`
        pub fn record_step(&self, outcome: &'static str, elapsed: Duration) {
            let attrs = [KeyValue::new("outcome", outcome)];
            self.steps_total.add(1, &attrs);
            self.step_duration.record(elapsed.as_secs_f64(), &attrs);
        }

        pub fn gather(&self) -> Option<String> {
            let registry = self.registry.as_ref()?;
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
                return None;
            }
            Some(String::from_utf8_lossy(&buffer).into_owned())
        }
    }

}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    const MAX_SQL_IN_SPAN: usize = 200;

    fn truncate(sql: &str) -> &str {
        match sql.char_indices().nth(MAX_SQL_IN_SPAN) {
            Some((idx, _)) => &sql[..idx],
            None => sql,
        }
    }

    pub fn run_span(plan: &str) -> Span {
        info_span!("tidemark.run", plan = plan)
    }

    pub fn verify_span(plan: &str) -> Span {
        info_span!("tidemark.verify", plan = plan)
    }

    pub fn step_span(step: &str, table: &str) -> Span {
        info_span!("tidemark.step", step = step, table = table)
    }

    pub fn execute_statement_span(sql: &str) -> Span {
        info_span!("tidemark.statement", sql = truncate(sql))
    }

    pub fn connect_span(backend: &str) -> Span {
        info_span!("tidemark.connect", backend = backend)
    }

}
