//! Shared command-line front end for the migration executables.
//!
//! Every binary takes the same optional flags and differs only in the plan it
//! runs. Exit code is 0 when every step is applied or already applied.

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use std::process;
use std::time::Duration;
use tidemark::migration::{
    MigrationPlan, MigrationResult, MigrationStep, PlanStatus, RunReport, Runner, SchemaSnapshot,
    StepOutcome, StepStatus,
};
use tidemark::{connect, DatabaseConfig, SqlExecutor};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Apply one schema migration plan; safe to run repeatedly")]
pub struct MigrateArgs {
    /// Database URL (postgres://... or the hosted backend's https:// URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Only report which steps are applied; exit 1 if any are pending
    #[arg(long)]
    pub check: bool,

    /// Print the manual SQL for the plan and exit without connecting
    #[arg(long)]
    pub print_sql: bool,

    /// Print the schema of every touched table after the run
    #[arg(long)]
    pub show_schema: bool,

    /// Print collected metrics in Prometheus text format after the run
    #[arg(long)]
    pub metrics: bool,

    /// Per-step timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl MigrateArgs {
    fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Entry point shared by every binary: parse flags, run `plan`, exit.
pub fn main_for(plan: MigrationPlan) -> ! {
    let args = MigrateArgs::parse();

    // .env may carry RUST_LOG
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_filter()))
        .init();

    match execute(&args, &plan) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {e:#}", "❌ Error:".red().bold());
            process::exit(1);
        }
    }
}

/// Run the requested mode and return the process exit code.
pub fn execute(args: &MigrateArgs, plan: &MigrationPlan) -> anyhow::Result<i32> {
    if args.print_sql {
        println!("-- {}", plan.name());
        println!("{}", plan.manual_sql());
        return Ok(0);
    }

    let config = load_config(args)?;
    let executor = connect(&config).context("failed to connect to the database")?;
    let runner = Runner::from_config(&config);

    if args.check {
        let status = runner.status(plan, executor.as_ref())?;
        for line in status_lines(&status) {
            println!("{line}");
        }
        return Ok(if status.is_up_to_date() { 0 } else { 1 });
    }

    if !args.quiet {
        println!("🔄 Running migration '{}' ({} steps)", plan.name(), plan.len());
    }
    let report = runner.run(plan, executor.as_ref())?;
    for result in &report.results {
        println!("{}", result_line(result));
    }
    if let Some(sql) = remediation_sql(&report, plan) {
        println!("\n💡 Apply the remaining changes by hand in the SQL editor:\n");
        println!("{sql}");
    }
    println!("\n📈 Summary: {}", summary_line(&report));

    if args.show_schema {
        show_schema(plan, executor.as_ref());
    }
    if args.metrics {
        match tidemark::metrics::render_prometheus() {
            Some(text) => println!("\n{text}"),
            None => log::warn!("metrics are not available in this build"),
        }
    }

    Ok(if report.is_success() { 0 } else { 1 })
}

/// Load configuration and apply command-line overrides before validating.
pub fn load_config(args: &MigrateArgs) -> anyhow::Result<DatabaseConfig> {
    let mut config = DatabaseConfig::from_sources().context("failed to load configuration")?;
    if let Some(url) = &args.database_url {
        config.url = url.clone();
    }
    if let Some(seconds) = args.timeout {
        config.step_timeout_seconds = seconds;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// One console line for an attempted step
pub fn result_line(result: &MigrationResult) -> String {
    let elapsed = format_elapsed(result.elapsed);
    match &result.outcome {
        StepOutcome::Applied => {
            format!("✅ {}: {} ({elapsed})", result.step, "applied".green())
        }
        StepOutcome::AlreadyApplied => {
            format!("✓  {}: {} ({elapsed})", result.step, "already applied".cyan())
        }
        StepOutcome::Failed(_) => {
            format!("❌ {}: {} ({elapsed})", result.step, result.outcome.to_string().red())
        }
    }
}

/// Counts plus when the run started and how long its steps took
pub fn summary_line(report: &RunReport) -> String {
    format!(
        "{report} (started {}, took {})",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        format_elapsed(report.total_elapsed())
    )
}

/// Manual SQL for the failed step and everything after it, if the run stopped early
pub fn remediation_sql(report: &RunReport, plan: &MigrationPlan) -> Option<String> {
    report.failed()?;
    let first_unfinished = report.results.len() - 1;
    let sql = plan.steps()[first_unfinished..]
        .iter()
        .map(|step| step.manual_sql())
        .collect::<Vec<_>>()
        .join("\n");
    Some(sql)
}

pub fn status_lines(status: &PlanStatus) -> Vec<String> {
    let mut lines = vec![format!("\n📊 Migration status: {}\n", status.plan)];
    lines.extend(status.steps.iter().map(status_line));
    if let Some(next) = status.next_pending() {
        lines.push(format!("\n⏳ Next pending step: {}", next.step));
    }
    lines.push(format!("\n📈 Summary: {status}"));
    lines
}

fn status_line(step: &StepStatus) -> String {
    if step.applied {
        format!("  ✓ {} [{}] {}", step.step, step.table, "applied".green())
    } else {
        format!("  ⏳ {} [{}] {}", step.step, step.table, "pending".yellow())
    }
}

fn show_schema(plan: &MigrationPlan, executor: &dyn SqlExecutor) {
    println!("\n📋 Current schema\n");
    for table in plan.tables() {
        match SchemaSnapshot::fetch(executor, table) {
            Ok(snapshot) => print!("{snapshot}"),
            Err(e) => log::warn!("Could not read schema of {table}: {e}"),
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
