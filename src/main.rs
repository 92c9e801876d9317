//! sertee - fan out a serial character device to multiple userspace CUSE
//! devices.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sertee::config::Args;
use sertee::SerteeError;

fn main() -> Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(code) => std::process::exit(code),
    };
    init_logging(&args);

    match sertee::bootstrap::run(args) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            std::process::exit(exit_code(&e));
        }
    }
}

/// Parses CLI args ourselves instead of calling `Args::parse()` directly:
/// clap's own `process::exit` on a bad invocation uses its default exit
/// code (2), bypassing spec.md §6's exit-code table (`1` for configuration
/// errors, `0` for `--help`/`--version`).
fn parse_args() -> std::result::Result<Args, i32> {
    use clap::error::ErrorKind;
    Args::try_parse().map_err(|e| {
        let _ = e.print();
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
            _ => SerteeError::Config(e.to_string()).exit_code(),
        }
    })
}

fn exit_code(e: &SerteeError) -> i32 {
    e.exit_code()
}

fn init_logging(args: &Args) {
    let level = args.log_level();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
