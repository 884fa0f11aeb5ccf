//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `stagehand`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Run the sector sealing pipeline on in-process workers sharing one store.",
    long_about = None
)]
pub struct CliArgs {
    /// Engine config file (TOML). Defaults are used when omitted.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of workers sharing the store.
    #[arg(long, default_value_t = 2, value_name = "N")]
    pub workers: usize,

    /// Number of sectors to seal.
    #[arg(long, default_value_t = 4, value_name = "N")]
    pub pipelines: usize,

    /// Make every SDRTrees attempt fail, to watch retries run out.
    #[arg(long)]
    pub fail_trees: bool,

    /// Make every PreCommit2 attempt hit an invariant violation, so the
    /// sectors stop before SDRTrees.
    #[arg(long)]
    pub corrupt_precommit: bool,

    /// Print the final status report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STAGEHAND_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
