use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use subject_harness::config::{self, HarnessConfig};
use subject_harness::{reports, Command, Controller, RunResult};

/// Run a subject program under supervision: isolate it in its own process
/// group, capture its output, and stop it on sentinel file or timeout.
#[derive(Parser, Debug)]
#[command(name = "subject-harness", version, about)]
pub struct Cli {
    /// Subject command and arguments (overrides config)
    #[arg(last = true, value_name = "ARGS")]
    args: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "harness.toml")]
    config: PathBuf,

    /// Timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Sentinel file whose appearance ends the run successfully (overrides config)
    #[arg(short, long, conflicts_with = "no_sentinel")]
    sentinel: Option<PathBuf>,

    /// Disable the sentinel file check
    #[arg(long)]
    no_sentinel: bool,

    /// Extra environment variable for the subject (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Wait for the subject to exit on its own (configured timing still applies, no sentinel)
    #[arg(long)]
    blocking: bool,

    /// Directory of gtest XML reports to check after the run (overrides config)
    #[arg(long)]
    reports_dir: Option<PathBuf>,

    /// Number of reports expected in the reports directory (overrides config)
    #[arg(long)]
    expected_reports: Option<usize>,

    /// Print the result as JSON instead of plain logs
    #[arg(long)]
    json: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (poll iterations, drain and teardown details)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Fold command-line overrides into the loaded config.
fn apply_overrides(config: &mut HarnessConfig, cli: &Cli) {
    if let Some((program, rest)) = cli.args.split_first() {
        config.command.program = program.clone();
        config.command.args = rest.to_vec();
    }
    config.command.env.extend(cli.env.iter().cloned());
    if let Some(timeout) = cli.timeout {
        config.run.timeout_secs = timeout;
    }
    if let Some(poll) = cli.poll_interval_ms {
        config.run.poll_interval_ms = poll;
    }
    if let Some(ref sentinel) = cli.sentinel {
        config.run.sentinel_file = Some(sentinel.clone());
    }
    if cli.no_sentinel || cli.blocking {
        config.run.sentinel_file = None;
    }
    if let Some(ref dir) = cli.reports_dir {
        config.reports.dir = Some(dir.clone());
    }
    if let Some(count) = cli.expected_reports {
        config.reports.expected_count = count;
    }
}

fn print_result(result: &RunResult, json: bool) {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(s) => println!("{s}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize result"),
        }
    } else {
        println!("{}", reports::format_logs(result));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "subject_harness=debug"
    } else {
        "subject_harness=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };
    apply_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        return ExitCode::from(2);
    }

    let controller = match Controller::for_platform(config.platform.kind) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };

    let command = Command::from(&config.command);
    let spec = match config.run.deadline_spec() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };

    if cli.dry_run {
        println!("subject-harness v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Platform: {}", controller.platform());
        println!("Command: {:?}", command.argv());
        println!("Environment: {:?}", command.env_vars());
        println!("Timeout: {:?}", spec.timeout);
        println!("Poll interval: {:?}", spec.poll_interval);
        match spec.sentinel_path {
            Some(ref p) => println!("Sentinel: {}", p.display()),
            None => println!("Sentinel: disabled"),
        }
        if let Some(ref dir) = config.reports.dir {
            println!(
                "Reports: {} (expecting {})",
                dir.display(),
                config.reports.expected_count
            );
        }
        println!("Dry run mode, not running.");
        return ExitCode::SUCCESS;
    }

    // Blocking mode only differs by the sentinel, which apply_overrides cleared.
    let result = match controller.run_until_signaled(&command, &spec).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };

    print_result(&result, cli.json);

    let mut ok = result.success();
    if let Some(ref dir) = config.reports.dir {
        let archive = reports::archive_dir_from_env();
        match reports::check_for_failures(dir, config.reports.expected_count, archive.as_deref()) {
            Ok(summary) => tracing::info!(reports = ?summary.checked, "all reports passed"),
            Err(e) => {
                tracing::error!("{e}");
                ok = false;
            }
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
