use clap::Parser;
use procwatch::config::{load_config, MonitorConfig};
use procwatch::signals::SignalHandler;
use procwatch::{spawn_monitor, ExitReport, LaunchError, LaunchSpec, MonitorError, OnLine, TimeoutCause};
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit status used when the run hit its total or idle timeout.
const EXIT_TIMED_OUT: u8 = 124;
/// procwatch itself failed (bad config, log file, ...).
const EXIT_INTERNAL: u8 = 125;
const EXIT_CANNOT_EXECUTE: u8 = 126;
const EXIT_NOT_FOUND: u8 = 127;
const EXIT_CANCELLED: u8 = 130;

/// Run a command, stream its combined output, and kill it (with everything
/// it spawned) when it runs too long or goes quiet.
#[derive(Parser, Debug)]
#[command(name = "procwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "procwatch.toml")]
    config: PathBuf,

    /// Total timeout in seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Idle timeout in seconds: longest gap between output lines (overrides config)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<f64>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Extra environment variable for the command, repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Append every output line to this file (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Don't keep output lines in memory
    #[arg(long)]
    no_store: bool,

    /// Milliseconds between the polite and the forced kill (overrides config)
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Kill only the command itself, not its descendants
    #[arg(long)]
    no_tree: bool,

    /// Print the exit report as JSON on stdout when done
    #[arg(long)]
    json: bool,

    /// Debug logging (supervisor decisions, kill escalation)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Command to run, followed by its arguments
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<OsString>,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// CLI flags win over file values.
fn apply_overrides(config: &mut MonitorConfig, cli: &Cli) {
    if let Some(secs) = cli.timeout {
        config.timeouts.total_secs = Some(secs);
    }
    if let Some(secs) = cli.idle_timeout {
        config.timeouts.idle_secs = Some(secs);
    }
    if let Some(path) = &cli.log_file {
        config.output.log_file = Some(path.clone());
    }
    if cli.no_store {
        config.output.store = false;
    }
    if let Some(ms) = cli.grace_ms {
        config.kill.grace_ms = ms;
    }
    if cli.no_tree {
        config.kill.tree = false;
    }
}

fn launch_spec(cli: &Cli, config: &MonitorConfig) -> Option<LaunchSpec> {
    let (program, args) = cli.command.split_first()?;
    let mut spec = LaunchSpec::new(program)
        .args(args)
        .track_tree(config.kill.tree);
    if let Some(dir) = &cli.cwd {
        spec = spec.cwd(dir);
    }
    for (key, value) in &cli.env {
        spec = spec.env(key, value);
    }
    Some(spec)
}

fn exit_code_for(report: &ExitReport) -> u8 {
    match report.cause {
        Some(TimeoutCause::TotalTimeout) | Some(TimeoutCause::IdleTimeout) => EXIT_TIMED_OUT,
        Some(TimeoutCause::Cancelled) => EXIT_CANCELLED,
        None => u8::try_from(report.status_code()).unwrap_or(1),
    }
}

fn exit_code_for_error(err: &MonitorError) -> u8 {
    match err {
        MonitorError::Launch(LaunchError::Spawn { source, .. }) => match source.kind() {
            std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
            _ => EXIT_CANNOT_EXECUTE,
        },
        _ => EXIT_INTERNAL,
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "procwatch=debug"
    } else if cli.quiet {
        "procwatch=warn"
    } else {
        "procwatch=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_settings(spec: &LaunchSpec, config: &MonitorConfig) {
    println!("procwatch v{}", env!("CARGO_PKG_VERSION"));
    println!("Program: {}", spec.get_program().display());
    let args: Vec<_> = spec.get_args().map(|a| a.to_string_lossy()).collect();
    println!("Args: {:?}", args);
    if let Some(dir) = spec.get_cwd() {
        println!("Working dir: {}", dir.display());
    }
    let secs = |v: Option<f64>| v.map_or_else(|| "none".to_string(), |s| format!("{}s", s));
    println!("Total timeout: {}", secs(config.timeouts.total_secs));
    println!("Idle timeout: {}", secs(config.timeouts.idle_secs));
    println!("Kill grace: {}ms", config.kill.grace_ms);
    println!("Kill tree: {}", config.kill.tree);
    println!("Store output: {}", config.output.store);
    if let Some(path) = &config.output.log_file {
        println!("Log file: {}", path.display());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("procwatch: {}", e);
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    apply_overrides(&mut config, &cli);

    let options = match config.wait_options() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("procwatch: {}", e);
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    let Some(spec) = launch_spec(&cli, &config) else {
        eprintln!("procwatch: no command given");
        return ExitCode::from(EXIT_INTERNAL);
    };

    if cli.dry_run {
        print_settings(&spec, &config);
        println!("Dry run: config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let forward = OnLine(|line: &str| {
        let mut out = std::io::stdout().lock();
        if writeln!(out, "{}", line).is_err() {
            tracing::debug!("stdout closed, dropping output line");
        }
    });
    let task = spawn_monitor(spec, options, forward);
    let _signals = SignalHandler::install(task.cancel_token());

    match task.join().await {
        Ok(outcome) => {
            let report = outcome.report;
            if cli.json {
                match serde_json::to_string(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize exit report"),
                }
            }
            if let Some(cause) = report.cause {
                eprintln!("procwatch: {} after {}ms, process tree killed", cause, report.duration_ms);
            }
            ExitCode::from(exit_code_for(&report))
        }
        Err(e) => {
            tracing::error!(error = %e, "monitor failed");
            eprintln!("procwatch: {}", e);
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn report(exit_code: Option<i32>, signal: Option<i32>, cause: Option<TimeoutCause>) -> ExitReport {
        ExitReport {
            pid: 42,
            exit_code,
            signal,
            cause,
            timed_out: cause.is_some_and(TimeoutCause::is_timeout),
            lines: 0,
            duration_ms: 10,
            started_at: Utc::now(),
            tree_tracked: true,
        }
    }

    #[test]
    fn test_command_after_separator_keeps_its_flags() {
        let cli = parse(&["procwatch", "--timeout", "5", "--", "ls", "-la", "--color"]);
        assert_eq!(cli.timeout, Some(5.0));
        assert_eq!(cli.command, vec!["ls", "-la", "--color"]);
    }

    #[test]
    fn test_command_is_required() {
        assert!(Cli::try_parse_from(["procwatch"]).is_err());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["procwatch", "-v", "-q", "--", "true"]).is_err());
    }

    #[test]
    fn test_parse_env() {
        assert_eq!(parse_env("A=1").unwrap(), ("A".to_string(), "1".to_string()));
        assert_eq!(parse_env("A=x=y").unwrap(), ("A".to_string(), "x=y".to_string()));
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_env("=1").is_err());
        assert!(parse_env("NOEQ").is_err());
    }

    #[test]
    fn test_repeatable_env_flag() {
        let cli = parse(&["procwatch", "--env", "A=1", "--env", "B=2", "--", "env"]);
        assert_eq!(cli.env.len(), 2);
        assert_eq!(cli.env[1], ("B".to_string(), "2".to_string()));
    }

    #[test]
    fn test_cli_overrides_config() {
        let mut config: MonitorConfig = toml::from_str(
            "[timeouts]\ntotal_secs = 600\nidle_secs = 60\n[kill]\ngrace_ms = 100\n",
        )
        .unwrap();
        let cli = parse(&[
            "procwatch",
            "--idle-timeout",
            "2.5",
            "--no-store",
            "--no-tree",
            "--log-file",
            "out.log",
            "--",
            "true",
        ]);
        apply_overrides(&mut config, &cli);

        assert_eq!(config.timeouts.total_secs, Some(600.0));
        assert_eq!(config.timeouts.idle_secs, Some(2.5));
        assert_eq!(config.kill.grace_ms, 100);
        assert!(!config.kill.tree);
        assert!(!config.output.store);
        assert_eq!(config.output.log_file, Some(PathBuf::from("out.log")));
    }

    #[test]
    fn test_launch_spec_from_cli() {
        let cli = parse(&["procwatch", "--cwd", "/tmp", "--", "make", "test"]);
        let spec = launch_spec(&cli, &MonitorConfig::default()).unwrap();
        assert_eq!(spec.get_program(), std::path::Path::new("make"));
        assert_eq!(spec.get_args().collect::<Vec<_>>(), vec!["test"]);
        assert_eq!(spec.get_cwd(), Some(std::path::Path::new("/tmp")));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&report(Some(0), None, None)), 0);
        assert_eq!(exit_code_for(&report(Some(3), None, None)), 3);
        assert_eq!(exit_code_for(&report(None, Some(9), None)), 137);
        assert_eq!(exit_code_for(&report(None, None, None)), 127);
        assert_eq!(
            exit_code_for(&report(None, Some(15), Some(TimeoutCause::IdleTimeout))),
            EXIT_TIMED_OUT
        );
        assert_eq!(
            exit_code_for(&report(None, Some(9), Some(TimeoutCause::TotalTimeout))),
            EXIT_TIMED_OUT
        );
        assert_eq!(
            exit_code_for(&report(None, Some(15), Some(TimeoutCause::Cancelled))),
            EXIT_CANCELLED
        );
        assert_eq!(exit_code_for(&report(Some(-1), None, None)), 1);
    }

    #[test]
    fn test_launch_failure_exit_codes() {
        let missing = MonitorError::Launch(LaunchError::Spawn {
            program: PathBuf::from("nope"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(exit_code_for_error(&missing), EXIT_NOT_FOUND);
        let denied = MonitorError::Launch(LaunchError::Spawn {
            program: PathBuf::from("nope"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        });
        assert_eq!(exit_code_for_error(&denied), EXIT_CANNOT_EXECUTE);
        assert_eq!(exit_code_for_error(&MonitorError::NotStarted), EXIT_INTERNAL);
    }
}
