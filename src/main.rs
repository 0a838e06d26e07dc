mod config;
mod crash;
mod error;
mod matcher;
mod monitor;
mod output;
mod prepare;
mod registry;
mod retry;
mod scenario;
mod session;

use clap::Parser;
use config::HarnessConfig;
use crash::ProcFs;
use scenario::{RunOptions, ScenarioRunner};
use std::path::PathBuf;
use std::process::ExitCode;

/// Boot an emulated target, crash it mid-workload, and check that it
/// recovers, without anyone typing into its console.
#[derive(Parser, Debug)]
#[command(name = "crashrex", version, about)]
pub struct Cli {
    /// Scenario name or regular expression; anything matching no scenario
    /// is run as a self-test name (e.g. `crash`, `log`, `usertests`, `sbrkbasic`)
    #[arg(value_name = "TESTREX", required_unless_present = "list")]
    testrex: Option<String>,

    /// Quick self-test: narrowed scope and a shorter timeout
    #[arg(short = 'q')]
    quick: bool,

    /// Config file path
    #[arg(short, long, default_value = "crashrex.toml")]
    config: PathBuf,

    /// Where to save captured output on failure (overrides config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extra logging (session lifecycle, poll ticks, retry decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Resolve the selector and print what would run, don't launch anything
    #[arg(long)]
    dry_run: bool,

    /// List registered scenarios and exit
    #[arg(long)]
    list: bool,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "crashrex=debug"
    } else {
        "crashrex=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.list {
        for entry in registry::REGISTRY {
            println!("{:<10} {}", entry.name, entry.description);
        }
        return ExitCode::SUCCESS;
    }

    let mut config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(output) = cli.output {
        config.output.diagnostics = output;
    }

    let options = RunOptions { quick: cli.quick };
    let runner = match ScenarioRunner::new(config, options, Box::new(ProcFs::new())) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let selector = cli.testrex.unwrap_or_default();
    if cli.dry_run {
        for line in runner.plan(&selector) {
            println!("{line}");
        }
        return ExitCode::SUCCESS;
    }

    tracing::info!(testrex = %selector, quick = cli.quick, "crashrex starting");
    match runner.run(&selector).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fail() => {
            tracing::error!(error = %e, "run failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "harness error");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
