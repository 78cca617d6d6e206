mod billing;
mod config;
mod events;
mod handler;
mod host;
mod logfile;
mod report;
mod runner;
mod state;
mod summary;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Session lifecycle hook: times each active chat session and, when the
/// session goes idle, queries the billing tool and posts a cost summary
/// back into the session.
#[derive(Parser, Debug)]
#[command(name = "billhook", version, about)]
pub struct Cli {
    /// Config file path (default: <config dir>/billhook/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging on stderr (query windows, skipped events)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume host events as JSON lines from stdin (default)
    Run,
    /// Query the billing tool once over a time window and print the summary
    Query {
        /// Window start, Unix seconds
        #[arg(long)]
        start_time: i64,
        /// Window end, Unix seconds
        #[arg(long)]
        end_time: i64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let config = match config::load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&cli, &config.log);
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.dry_run {
        return dry_run(&config_path, &config);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Query {
            start_time,
            end_time,
        } => query_once(&config, start_time, end_time).await,
    }
}

/// Stderr for humans, the rotating file for the record. Stdout is reserved
/// for prompts in stdout host mode.
fn init_tracing(cli: &Cli, log: &config::LogConfig) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let sink = logfile::RotatingFile::new(log.file_path(), log.max_size_bytes, log.max_files);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_filter(filter),
        )
        .with(logfile::file_layer(sink, log.level_filter()))
        .init();
}

fn dry_run(config_path: &std::path::Path, config: &config::HookConfig) -> ExitCode {
    println!("billhook v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", config_path.display());
    match toml::to_string_pretty(config) {
        Ok(text) => println!("\n{text}"),
        Err(e) => println!("(failed to render config: {e})"),
    }
    match billing::BillingTool::locate(&config.billing.tool_path) {
        Ok(tool) => println!("Billing tool: ok ({})", tool.path().display()),
        Err(e) => println!("Billing tool: {e}"),
    }
    println!("Log file: {}", config.log.file_path().display());
    ExitCode::SUCCESS
}

async fn run(config: config::HookConfig) -> ExitCode {
    let host = match host::ConfiguredHost::from_config(&config.host) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up host delivery");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        tool = %config.billing.tool_path.display(),
        host_mode = ?config.host.mode,
        "billhook starting"
    );

    let mut handler = handler::EventHandler::new(host, config.billing, config.log.file_path());
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    match runner::run_events(stdin, &mut handler).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "failed to read events");
            ExitCode::FAILURE
        }
    }
}

async fn query_once(config: &config::HookConfig, start: i64, end: i64) -> ExitCode {
    let tool = match billing::BillingTool::locate(&config.billing.tool_path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!(
                "set {} or install the tool at the default path",
                config::TOOL_PATH_ENV
            );
            return ExitCode::FAILURE;
        }
    };

    let window = billing::TimeWindow { start, end };
    match tool.query(window, config.billing.timeout()).await {
        Ok(output) => {
            match report::parse_report(&output.stdout) {
                Some(r) => println!(
                    "{}",
                    summary::format_summary(&r, window.span_secs(), &config.billing.currency_symbol)
                ),
                None => println!("No billable usage in this window."),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            if let billing::BillingError::Failed { output } = &e {
                eprint!("{}{}", output.stdout, output.stderr);
            }
            ExitCode::FAILURE
        }
    }
}
