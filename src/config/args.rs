//! CLI argument parsing using clap

use clap::Parser;

/// Fan out a serial character device to multiple userspace CUSE devices.
#[derive(Parser, Debug)]
#[command(name = "sertee")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Comma-separated list of synthetic device names to register
    #[arg(short = 'n', long = "name", value_delimiter = ',', required = true)]
    pub name: Vec<String>,

    /// Path to the source character device
    #[arg(short = 'S', long = "source", required = true)]
    pub source: String,

    /// Ring capacity in bytes
    #[arg(long = "bufsize", default_value_t = 1024)]
    pub bufsize: usize,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}
