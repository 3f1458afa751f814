//! CLI benchmark harness over the two heaplab back-ends.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use heaplab::AllocatorKind;

mod workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AllocatorArg {
    Segregated,
    Mckusick,
    All,
}

impl AllocatorArg {
    fn kinds(self) -> &'static [AllocatorKind] {
        match self {
            AllocatorArg::Segregated => &[AllocatorKind::Segregated],
            AllocatorArg::Mckusick => &[AllocatorKind::McKusick],
            AllocatorArg::All => &[AllocatorKind::Segregated, AllocatorKind::McKusick],
        }
    }
}

/// Memory allocator benchmark harness.
#[derive(Debug, Parser)]
#[command(name = "bench")]
struct Args {
    /// Allocator to benchmark.
    #[arg(long, value_enum, default_value_t = AllocatorArg::All)]
    allocator: AllocatorArg,

    /// Operation count per benchmark.
    #[arg(long, default_value_t = 10_000)]
    num_ops: usize,

    /// CSV output path; stdout when omitted.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Parse failures print usage to stderr and exit 1; --help is
            // routed to stdout and exits 0.
            let failed = err.use_stderr();
            let _ = err.print();
            return if failed {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bench: {err}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> io::Result<()> {
    // Progress goes to stderr through the logger, so stdout stays a clean
    // CSV stream when no output path is given.
    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };

    writeln!(out, "{}", workload::CSV_HEADER)?;
    for &kind in args.allocator.kinds() {
        workload::run_all(kind, args.num_ops, &mut *out)?;
    }
    out.flush()?;

    if let Some(path) = &args.output {
        log::info!("results written to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_everything_to_stdout() {
        let args = Args::try_parse_from(["bench"]).unwrap();
        assert_eq!(args.allocator, AllocatorArg::All);
        assert_eq!(args.num_ops, 10_000);
        assert!(args.output.is_none());
        assert_eq!(args.allocator.kinds().len(), 2);
    }

    #[test]
    fn single_allocator_selection() {
        let args =
            Args::try_parse_from(["bench", "--allocator", "mckusick", "--num-ops", "1000"])
                .unwrap();
        assert_eq!(args.allocator.kinds(), &[AllocatorKind::McKusick]);
        assert_eq!(args.num_ops, 1000);
    }

    #[test]
    fn unknown_option_is_an_error() {
        let err = Args::try_parse_from(["bench", "--frobnicate"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn missing_argument_value_is_an_error() {
        let err = Args::try_parse_from(["bench", "--num-ops"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn help_is_not_an_error() {
        let err = Args::try_parse_from(["bench", "--help"]).unwrap_err();
        assert!(!err.use_stderr());
    }
}
