//! VCF statistics worker main executable

pub mod annotate;
pub mod common;
pub mod conf;
pub mod err;
pub mod ingest;
pub mod query;
pub mod show;
pub mod store;

use clap::{Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "VCF ingestion and statistics",
    long_about = "This tool validates VCF files, computes variant statistics and stores them in a queryable variant store"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a VCF file into a variant store.
    Ingest(ingest::Args),
    /// Filter the variant table of a store.
    Query(query::Args),
    /// Show metadata and statistics of a store.
    Show(show::Args),
    /// Annotate the variant table of a store.
    Annotate(annotate::Args),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let term = Term::stderr();
    tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Ingest(args) => ingest::run(&cli.common, args)?,
            Commands::Query(args) => query::run(&cli.common, args)?,
            Commands::Show(args) => show::run(&cli.common, args)?,
            Commands::Annotate(args) => annotate::run(&cli.common, args)?,
        }

        Ok::<(), anyhow::Error>(())
    })?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}
