mod config;
mod db;
mod display;
mod monitor;
mod mssql;
mod process;
mod signals;
#[cfg(test)]
mod test_utils;

use clap::builder::NonEmptyStringValueParser;
use clap::error::ErrorKind;
use clap::{ArgGroup, CommandFactory, Parser};
use config::ConfigError;
use display::Console;
use monitor::Outcome;
use mssql::MssqlSession;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status when the connection or a poll fails.
const EXIT_FAILURE: u8 = 1;
/// Exit status when the wait is interrupted (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

const EXAMPLES: &str = "\
Examples:
  sqlwaitfor -S server\\instance -E -s 13
  sqlwaitfor -S server\\instance -u user -p pass -s 12,20,567
  sqlwaitfor -S server -P 1434 -E -v -L domain\\username";

/// Blocks until a set of SQL Server processes (by session ID, or every
/// session of one login) finish executing. Useful in batch scripts.
#[derive(Parser, Debug)]
#[command(name = "sqlwaitfor", version, about, after_help = EXAMPLES)]
#[command(group(ArgGroup::new("target").required(true).args(["spids", "login"])))]
pub struct Cli {
    /// SQL Server instance to connect to (host, host\instance or host,port)
    #[arg(short = 'S', long)]
    server: Option<String>,

    /// Server port to connect to
    #[arg(short = 'P', long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Use integrated authentication (default when no username is given)
    #[arg(short = 'E', long, conflicts_with = "username")]
    trusted: bool,

    /// Username for SQL authentication
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Password for SQL authentication
    #[arg(short = 'p', long, env = "SQLWAITFOR_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Session ID(s) to monitor, comma-separated
    #[arg(
        short = 's',
        long = "spid",
        value_name = "SPID",
        value_delimiter = ',',
        value_parser = clap::value_parser!(i32).range(1..)
    )]
    spids: Vec<i32>,

    /// Login name whose sessions to monitor (exact match)
    #[arg(short = 'L', long, value_parser = NonEmptyStringValueParser::new())]
    login: Option<String>,

    /// Seconds to wait between checks (default: 5)
    #[arg(short = 't', long = "interval", value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Verbose output (includes detailed process/query info)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Quiet mode (no output unless there is an error)
    #[arg(short, long)]
    quiet: bool,

    /// Config file path (default: sqlwaitfor.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Accept the server's TLS certificate without validation
    #[arg(long)]
    trust_cert: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sqlwaitfor=warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let settings = match config::load_config(cli.config.as_deref())
        .and_then(|file| config::resolve(&cli, file))
    {
        Ok(settings) => settings,
        Err(e) => usage_error(&e),
    };
    tracing::debug!(
        server = %settings.connection.display_addr(),
        target = ?settings.target,
        interval_secs = settings.interval.as_secs(),
        "resolved settings"
    );

    let mut console = Console::stdio(settings.verbosity);
    console.banner();

    let session = match MssqlSession::connect(&settings.connection).await {
        Ok(session) => session,
        Err(e) => {
            console.error(&e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match monitor::watch(
        session,
        settings.target,
        settings.interval,
        &mut console,
        signals::shutdown(),
    )
    .await
    {
        Ok(Outcome::Idle) => ExitCode::SUCCESS,
        Ok(Outcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            console.error(&e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Report a configuration problem the way clap reports its own, with usage
/// and exit status 2.
fn usage_error(error: &ConfigError) -> ! {
    let kind = match error {
        ConfigError::MissingServer
        | ConfigError::MissingPassword
        | ConfigError::MissingUsername
        | ConfigError::MissingTarget => ErrorKind::MissingRequiredArgument,
        ConfigError::Read { .. } => ErrorKind::Io,
        ConfigError::Parse { .. }
        | ConfigError::InvalidServer { .. }
        | ConfigError::InvalidInterval { .. } => ErrorKind::InvalidValue,
    };
    Cli::command().error(kind, error).exit()
}
