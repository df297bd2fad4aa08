//! CLI argument parsing for the trace inspector

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for decoded calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One call per line: `tstart tend depth func(args)` (default)
    Text,
    /// JSON array of call records
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "iorecorder")]
#[command(version)]
#[command(about = "Inspect grammar-compressed parallel I/O traces", long_about = None)]
pub struct Cli {
    /// Trace directory written by a recorder session
    #[arg(value_name = "TRACE_DIR")]
    pub trace_dir: PathBuf,

    /// Decode only this rank (default: all ranks)
    #[arg(short, long, value_name = "N")]
    pub rank: Option<usize>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Print per-rank signature, rule and call counts instead of calls
    #[arg(short = 's', long = "summary")]
    pub summary: bool,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}
