mod config;
mod data_dir;
mod detector;
mod history;
mod lock;
mod perturb;
mod report;
mod runner;
mod scenario;
mod session;
mod signals;
mod stats;

use clap::{Args, Parser, Subcommand};
use config::BenchConfig;
use data_dir::DataDir;
use report::ReportOptions;
use runner::BenchContext;
use signals::SignalHandler;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

/// Benchmarks watch-mode type checkers: starts each tool on each fixture,
/// edits a few source files, and times how long every incremental check takes.
#[derive(Parser, Debug)]
#[command(name = "watchbench", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "watchbench.toml", global = true)]
    config: PathBuf,

    /// Extra logging (state transitions, every round)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and the final report
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the benchmark matrix (default)
    Run(RunArgs),
    /// Print the scenario matrix without running anything
    List,
    /// Show recorded runs from the history database
    History {
        /// Only runs of this scenario label (e.g. "tsc/small")
        #[arg(long)]
        label: Option<String>,

        /// How many rows to show
        #[arg(long, default_value_t = 20)]
        last: i64,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Override bench.iterations
    #[arg(long)]
    iterations: Option<u32>,

    /// Override bench.rounds
    #[arg(long)]
    rounds: Option<u32>,

    /// Only run scenarios whose label contains this text (repeatable)
    #[arg(long)]
    only: Vec<String>,

    /// Run one scenario at a time, even across fixtures
    #[arg(long)]
    sequential: bool,

    /// Don't record this invocation in the history database
    #[arg(long)]
    no_history: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match BenchConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        None => run(config, RunArgs::default()).await,
        Some(Command::Run(args)) => run(config, args).await,
        Some(Command::List) => {
            print!("{}", list(&config));
            ExitCode::SUCCESS
        }
        Some(Command::History { label, last }) => show_history(&config, label.as_deref(), last),
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "watchbench=debug"
    } else if cli.quiet {
        "watchbench=warn"
    } else {
        "watchbench=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(mut config: BenchConfig, args: RunArgs) -> ExitCode {
    if let Some(iterations) = args.iterations {
        config.bench.iterations = iterations;
    }
    if let Some(rounds) = args.rounds {
        config.bench.rounds = rounds;
    }
    let parallel = config.bench.parallel && !args.sequential;

    let scenarios = scenario::expand_matrix(&config, &args.only);
    if scenarios.is_empty() {
        eprintln!("error: no scenario label matches {:?}", args.only);
        return ExitCode::from(1);
    }

    let mut signals = match SignalHandler::install() {
        Ok(handler) => handler,
        Err(e) => {
            eprintln!("error: failed to install signal handlers: {e}");
            return ExitCode::from(1);
        }
    };

    let run_id = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    tracing::info!(
        run_id = %run_id,
        scenarios = scenarios.len(),
        iterations = config.bench.iterations,
        rounds = config.bench.rounds,
        parallel,
        "watchbench starting"
    );

    let context = tokio::select! {
        context = runner::run_benchmarks(&scenarios, &config.bench, &config.markers, parallel) => context,
        shutdown = signals.recv() => {
            // Dropping the run future drops every live session, which kills its process group.
            tracing::warn!(signal = %shutdown, "interrupted, stopping watch processes");
            return ExitCode::from(130);
        }
    };

    let previous = persist(&config, &args, &run_id, &context);
    let options = ReportOptions {
        baseline: config.report.baseline.clone(),
        previous,
    };
    print!("{}", report::render(&context, &options));

    if context.has_missing_fixtures() {
        tracing::error!(
            scenarios = ?context.missing_fixtures,
            "some fixtures had no files to perturb"
        );
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

/// Write the JSON results and history rows. Returns the previous medians
/// used for the comparison column. Failures here never fail the run.
fn persist(
    config: &BenchConfig,
    args: &RunArgs,
    run_id: &str,
    context: &BenchContext,
) -> HashMap<String, f64> {
    let data_dir = DataDir::new(&config.data.dir);
    if let Err(e) = data_dir.ensure_initialized() {
        tracing::warn!(dir = %data_dir.root().display(), error = %e, "cannot create data directory");
        return HashMap::new();
    }

    let results = data_dir.result_file(run_id);
    match report::write_json(&results, run_id, context) {
        Ok(()) => tracing::info!(path = %results.display(), "results written"),
        Err(e) => tracing::warn!(error = %e, "failed to write results file"),
    }

    if !config.data.history {
        return HashMap::new();
    }
    match record_history(&data_dir, run_id, context, !args.no_history) {
        Ok(previous) => previous,
        Err(e) => {
            tracing::warn!(path = %data_dir.history_db().display(), error = %e, "history database unavailable");
            HashMap::new()
        }
    }
}

fn record_history(
    data_dir: &DataDir,
    run_id: &str,
    context: &BenchContext,
    record: bool,
) -> rusqlite::Result<HashMap<String, f64>> {
    let conn = history::open_or_create(&data_dir.history_db())?;
    if record {
        for run in &context.records {
            history::insert_run(
                &conn,
                run_id,
                &run.label,
                run.iteration,
                &run.stats,
                run.error.as_deref(),
            )?;
        }
    }
    history::previous_medians(&conn, run_id)
}

/// One line per scenario: label, working directory, command line.
fn list(config: &BenchConfig) -> String {
    let scenarios = scenario::expand_matrix(config, &[]);
    let width = scenarios
        .iter()
        .map(|s| s.label.len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for s in &scenarios {
        let mut command = s.launch.command.clone();
        for arg in &s.launch.args {
            command.push(' ');
            command.push_str(arg);
        }
        out.push_str(&format!(
            "{:<width$}  {}  {}\n",
            s.label,
            s.launch.cwd.display(),
            command
        ));
    }
    out
}

fn show_history(config: &BenchConfig, label: Option<&str>, last: i64) -> ExitCode {
    let data_dir = DataDir::new(&config.data.dir);
    let path = data_dir.history_db();
    if !path.exists() {
        print!("{}", report::render_history(&[]));
        return ExitCode::SUCCESS;
    }
    let rows = history::open_or_create(&path).and_then(|conn| history::list_runs(&conn, label, last));
    match rows {
        Ok(rows) => {
            print!("{}", report::render_history(&rows));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: failed to read {}: {e}", path.display());
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["watchbench"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("watchbench.toml"));
    }

    #[test]
    fn test_cli_run_flags() {
        let cli = Cli::try_parse_from([
            "watchbench",
            "run",
            "--rounds",
            "4",
            "--only",
            "tsc",
            "--only",
            "small",
            "--sequential",
            "-c",
            "bench.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("bench.toml"));
        match cli.command {
            Some(Command::Run(args)) => {
                assert_eq!(args.rounds, Some(4));
                assert_eq!(args.only, vec!["tsc", "small"]);
                assert!(args.sequential);
                assert!(!args.no_history);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_verbose_and_quiet() {
        assert!(Cli::try_parse_from(["watchbench", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_list_prints_matrix() {
        let config = BenchConfig::parse(
            r#"
            [[tool]]
            name = "tsc"
            command = "npx"
            args = ["tsc", "--watch", "-p", "{root}"]

            [[tool]]
            name = "tsgo"
            command = "tsgo"
            args = ["--watch"]

            [[fixture]]
            name = "small"
            root = "/fixtures/small"
            "#,
        )
        .unwrap();

        let text = list(&config);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("tsc/small"));
        assert!(lines[0].ends_with("npx tsc --watch -p /fixtures/small"));
        assert!(lines[1].starts_with("tsgo/small"));
    }

    #[test]
    fn test_record_history_reads_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(tmp.path().join(".watchbench"));
        data_dir.init().unwrap();

        let mut context = BenchContext::default();
        context.record(
            0,
            scenario::ScenarioOutcome {
                label: "tsc/small".to_string(),
                stats: stats::RunStatistics::from_samples(
                    stats::RunStatus::Completed,
                    std::time::Duration::from_secs(2),
                    std::time::Duration::from_secs(1),
                    vec![stats::CycleSample::new(0, std::time::Duration::from_millis(80))],
                    None,
                ),
                error: None,
            },
        );

        let first = record_history(&data_dir, "r1", &context, true).unwrap();
        assert!(first.is_empty());
        let second = record_history(&data_dir, "r2", &context, false).unwrap();
        assert_eq!(second.get("tsc/small"), Some(&80.0));
        // Not recorded, so only r1 is in the table.
        let conn = history::open_or_create(&data_dir.history_db()).unwrap();
        assert_eq!(history::list_runs(&conn, None, 10).unwrap().len(), 1);
    }
}
