use anyhow::{Context, Result};
use clap::Parser;
use iorecorder::cli::{Cli, OutputFormat};
use iorecorder::reader::TraceReader;
use iorecorder::record::CallRecord;
use std::io::Write;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_summary(reader: &TraceReader, ranks: &[usize]) -> Result<()> {
    let parts = ranks
        .iter()
        .map(|&rank| {
            reader
                .read(rank)
                .with_context(|| format!("failed to read rank {}", rank))
        })
        .collect::<Result<Vec<_>>>()?;

    let meta = reader.metadata();
    println!("trace:      {}", reader.dir().display());
    println!("ranks:      {}", meta.total_ranks);
    println!("resolution: {}s", meta.time_resolution);
    println!("merged:     {}", meta.merged());
    println!("functions:  {}", meta.function_names.len());
    println!();
    println!("{:>6} {:>12} {:>8} {:>10} {:>12}", "rank", "signatures", "rules", "symbols", "calls");

    for p in &parts {
        println!(
            "{:>6} {:>12} {:>8} {:>10} {:>12}",
            p.rank,
            p.cst.len(),
            p.grammar.rule_count(),
            p.grammar.symbol_count(),
            p.grammar.expanded_len()
        );
    }
    Ok(())
}

fn write_records(records: &[CallRecord], format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, records)?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            for r in records {
                writeln!(out, "{:.7} {:.7} {} {}", r.tstart, r.tend, r.depth, r.call_text())?;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let reader = TraceReader::open(&args.trace_dir)
        .with_context(|| format!("failed to open trace {}", args.trace_dir.display()))?;

    let ranks: Vec<usize> = match args.rank {
        Some(rank) if rank >= reader.ranks() => {
            anyhow::bail!("rank {} out of range: trace has {} ranks", rank, reader.ranks())
        }
        Some(rank) => vec![rank],
        None => (0..reader.ranks()).collect(),
    };

    if args.summary {
        return print_summary(&reader, &ranks);
    }

    // Decode everything first so a failure produces no partial output
    let mut records = Vec::new();
    for rank in ranks {
        let decoded = reader
            .read_records(rank)
            .with_context(|| format!("failed to decode rank {}", rank))?;
        records.extend(decoded);
    }

    write_records(&records, args.format)
}
