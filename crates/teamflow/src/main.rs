mod commands;
mod error;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Commands;
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "teamflow")]
#[command(about = "Inspect persisted saga snapshots", long_about = None)]
struct Cli {
    /// Directory holding saga snapshots (default: current directory)
    #[arg(long = "state-dir", global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let state_dir = match resolve_state_dir(cli.state_dir) {
        Ok(dir) => dir,
        Err(e) => {
            print_error(&e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = cli.command.execute(&state_dir) {
        print_error(&e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_state_dir(dir: Option<PathBuf>) -> Result<PathBuf, CliError> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().map_err(CliError::CurrentDir)?,
    };

    // A missing directory is fine: it just holds no snapshots yet.
    if dir.is_file() {
        return Err(CliError::StateDirIsFile { path: dir });
    }
    Ok(dir)
}

fn print_error(error: &CliError) {
    eprint!("{}", error_report(error));
}

fn error_report(error: &CliError) -> String {
    let mut report = format!("error: {error}\n");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let _ = writeln!(report, "caused by: {cause}");
        source = std::error::Error::source(cause);
    }
    report
}
