mod agent;
mod assertions;
mod config;
mod extract;
mod llm;
mod mcp;
mod planner;
mod report;
mod template;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::parse_success_rate;
use crate::planner::{Planner, RunResults};
use crate::report::{Report, ReportKind};
use crate::template::TemplateContext;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "agentbench",
    about = "Benchmark MCP tool-using LLM agents",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single benchmark file
    Run {
        /// Path to the benchmark YAML file
        input: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Run a suite of benchmark files
    Suite {
        /// Path to the suite YAML file
        input: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(clap::Args)]
struct OutputArgs {
    /// Report format: html, json, or md
    #[arg(long, default_value = "json")]
    report_type: String,

    /// Where to write the report (default: agentbench-report.<ext>)
    #[arg(long)]
    report_output: Option<PathBuf>,

    /// Log per-iteration detail
    #[arg(short, long)]
    verbose: bool,
}

const EXIT_RUNTIME: u8 = 1;
const EXIT_CONFIG: u8 = 2;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (input, output, suite) = match cli.command {
        Commands::Run { input, output } => (input, output, false),
        Commands::Suite { input, output } => (input, output, true),
    };

    init_tracing(output.verbose);

    let kind = match ReportKind::parse(&output.report_type) {
        Ok(kind) => kind,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // First Ctrl+C cancels the run gracefully; a second one forces exit.
    let cancel = CancellationToken::new();
    let cancel_handler = cancel.clone();
    let interrupted = std::sync::Arc::new(std::sync::atomic::AtomicU8::new(0));
    let interrupted_handler = interrupted.clone();
    ctrlc::set_handler(move || {
        let count = interrupted_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if count >= 1 {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted, finishing current execution. Press Ctrl+C again to force quit.");
        cancel_handler.cancel();
    })
    .ok();

    match run(&input, suite, kind, output.report_output.as_deref(), &cancel).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_RUNTIME),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "agentbench=debug" } else { "agentbench=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().expect("static directive parses")),
        )
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// Run orchestration
// ---------------------------------------------------------------------------

/// Execute the benchmark (or suite), write the report, and return whether
/// the success criterion was met. Errors here are configuration-fatal.
async fn run(
    input: &Path,
    suite: bool,
    kind: ReportKind,
    report_output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let seed: u64 = rand::random();
    let mut ctx = TemplateContext::new(seed, &Default::default());

    let (results, success_rate) = if suite {
        run_suite(input, &mut ctx, cancel).await?
    } else {
        let config = config::load_test_config(input, &mut ctx)?;
        let success_rate = parse_success_rate(config.criteria.success_rate.as_deref());
        let planner = Planner::build(config).await?;
        let results = planner.execute(cancel, &ctx).await;
        planner.shutdown().await;
        (results, success_rate)
    };

    let report = Report::from_results(&results);
    let default_path = PathBuf::from(format!("agentbench-report.{}", kind.extension()));
    let path = report_output.unwrap_or(default_path.as_path());
    report.write(path, kind)?;

    let success = results.meets(success_rate);
    println!(
        "{} passed / {} failed / {} total ({:.1}% pass rate, criterion {:.0}%), report: {}",
        results.passed(),
        results.total() - results.passed(),
        results.total(),
        results.pass_rate() * 100.0,
        success_rate * 100.0,
        path.display(),
    );

    Ok(success && !cancel.is_cancelled())
}

/// Run every file of a suite, merging outcomes into one result set.
async fn run_suite(
    input: &Path,
    ctx: &mut TemplateContext,
    cancel: &CancellationToken,
) -> Result<(RunResults, f64)> {
    let suite = config::load_suite_config(input, ctx)?;
    let suite_dir = input.parent().unwrap_or_else(|| Path::new("."));
    let success_rate = parse_success_rate(suite.criteria.success_rate.as_deref());

    let mut results = RunResults::default();
    for file in &suite.test_files {
        if cancel.is_cancelled() {
            break;
        }
        let path = resolve_test_file(suite_dir, file);
        tracing::info!(file = %path.display(), "running suite file");

        let mut file_ctx = ctx.clone();
        let config = config::load_suite_test_config(&path, &mut file_ctx, &suite)
            .with_context(|| format!("loading suite file {}", path.display()))?;
        let planner = Planner::build(config).await?;
        results.merge(planner.execute(cancel, &file_ctx).await);
        planner.shutdown().await;
    }

    Ok((results, success_rate))
}

fn resolve_test_file(suite_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        suite_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_test_file() {
        assert_eq!(
            resolve_test_file(Path::new("/suite/dir"), "tests/a.yaml"),
            PathBuf::from("/suite/dir/tests/a.yaml")
        );
        assert_eq!(
            resolve_test_file(Path::new("/suite/dir"), "/abs/a.yaml"),
            PathBuf::from("/abs/a.yaml")
        );
    }

    #[tokio::test]
    async fn test_run_without_providers_succeeds_vacuously() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty.yaml");
        std::fs::write(&input, "sessions: []\n").unwrap();
        let report_path = dir.path().join("report.json");

        let cancel = CancellationToken::new();
        let success = run(&input, false, ReportKind::Json, Some(report_path.as_path()), &cancel)
            .await
            .unwrap();
        assert!(success);
        assert!(report_path.exists());
    }

    #[tokio::test]
    async fn test_run_missing_file_is_config_error() {
        let cancel = CancellationToken::new();
        let result = run(
            Path::new("/nonexistent/bench.yaml"),
            false,
            ReportKind::Json,
            None,
            &cancel,
        )
        .await;
        assert!(result.is_err());
    }
}
