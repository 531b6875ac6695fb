use crate::commands::{BuildCmd, HashCmd, VerifyCmd};
use crate::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Builds and verifies UTXO commitments.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log filter, e.g. `info` or `subcoin_utxo_commitment=debug`.
    ///
    /// Falls back to `RUST_LOG`, then to `info`.
    #[arg(long, global = true)]
    pub log: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Build a commitment from a UTXO dump in the `dumptxoutset --csv` format.
    Build(BuildCmd),

    /// Verify payload files against a manifest, optionally importing them into a database.
    Verify(VerifyCmd),

    /// Print the accumulator of a single payload file.
    Hash(HashCmd),
}

impl Command {
    pub fn run(self) -> Result<()> {
        match self {
            Self::Build(cmd) => cmd.run(),
            Self::Verify(cmd) => cmd.run(),
            Self::Hash(cmd) => cmd.run(),
        }
    }
}

fn init_logger(log: Option<&str>) {
    let filter = match log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // Only fails if a global subscriber was already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parses the command line and runs the command.
pub fn run() -> Result<()> {
    let Cli { command, log } = Cli::parse();
    init_logger(log.as_deref());
    command.run()
}
