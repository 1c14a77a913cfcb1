//! Print the content of an existing variant store without re-ingesting.

use std::io::Write;

use crate::{
    conf::Settings,
    err::IngestError,
    store::{
        VariantStore, META_ANNOTATED, META_INPUT_COMPRESSION, META_INPUT_PATH,
        META_WORKER_VERSION,
    },
};

/// The sections that can be shown.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Section {
    #[default]
    All,
    Metadata,
    Stats,
    Schema,
}

/// Write the requested `section` of `store` as tab-separated blocks to `out`.
pub fn write_report<W: Write>(
    store: &VariantStore,
    section: Section,
    out: &mut W,
) -> Result<(), anyhow::Error> {
    let all = section == Section::All;
    if all {
        writeln!(out, "# store\t{}", store.path().display())?;
        for key in [
            META_WORKER_VERSION,
            META_INPUT_PATH,
            META_INPUT_COMPRESSION,
            META_ANNOTATED,
        ] {
            if let Some(value) = store.meta(key)? {
                writeln!(out, "{}\t{}", key, value)?;
            }
        }
        writeln!(out, "rows\t{}", store.row_count()?)?;
    }
    if all || section == Section::Metadata {
        writeln!(out, "# metadata")?;
        for entry in store.metadata()? {
            writeln!(out, "{}\t{}", entry.tag, entry.value)?;
        }
    }
    if all || section == Section::Stats {
        writeln!(out, "# stats")?;
        for row in store.stats()? {
            writeln!(out, "{}\t{}", row.tag, row.result)?;
        }
    }
    if all || section == Section::Schema {
        writeln!(out, "# schema")?;
        for column in store.schema()?.columns {
            writeln!(out, "{}\t{}", column.name, column.kind)?;
        }
    }
    Ok(())
}

/// Command line arguments for `show` sub command.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Show metadata and statistics of a store", long_about = None)]
pub struct Args {
    /// Path to configuration file, defaults to `conf.toml` in the working directory.
    #[arg(long)]
    pub path_conf: Option<String>,
    /// Path to the variant store, defaults to the store in the working directory.
    #[arg(long)]
    pub path_store: Option<String>,
    /// The section to show.
    #[arg(long, value_enum, default_value_t = Section::default())]
    pub section: Section,
}

/// Main entry point for `show` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let path_store = match &args.path_store {
        Some(path) => std::path::PathBuf::from(path),
        None => Settings::load(args.path_conf.as_deref())?.path_store()?,
    };
    let store = VariantStore::open_read_only(&path_store).map_err(|e| match e {
        IngestError::FileAccess { .. } => {
            anyhow::anyhow!("no store at {:?}, run `ingest` first: {}", &path_store, e)
        }
        e => anyhow::anyhow!("could not open store: {}", e),
    })?;

    let mut term = console::Term::stdout();
    write_report(&store, args.section, &mut term)?;
    term.flush()?;

    Ok(())
}
