//! Ingestion of a VCF file into a variant store.
//!
//! The pipeline runs the stages in order, threading an explicit context
//! from one stage to the next:
//!
//! 1. check that the input file exists and is not empty
//! 2. sniff the compression and validate the first lines
//! 3. decompress into a working copy
//! 4. extract the header metadata and compute the statistics
//! 5. derive the column schema
//! 6. encode the records chunk by chunk into the store
//! 7. optionally annotate the stored table
//!
//! The store is only created once validation succeeded, so a rejected file
//! never leaves a table behind.

pub mod encode;
pub mod header;
pub mod report;
pub mod schema;
pub mod stats;
pub mod validate;

use std::path::{Path, PathBuf};

use thousands::Separable;

use crate::{
    annotate::{self, AnnotationSource, VepClient},
    common::{
        self,
        io::{self as cio, Compression, HEAD_LINES},
    },
    conf::{AnnotationSettings, Settings, StoreCompression},
    err::IngestError,
    store::{VariantStore, META_INPUT_COMPRESSION, META_INPUT_PATH},
};

use self::{
    report::{ProgressBand, Reporter, TracingReporter},
    stats::{AltTallyPolicy, VariantStatistics},
    validate::Validation,
};

/// Progress milestones.
const PROGRESS_VERIFY_FILE: f32 = 3.0;
const PROGRESS_VERIFY_VCF: f32 = 8.0;
const PROGRESS_DECOMPRESS: f32 = 9.0;
const PROGRESS_METADATA: f32 = 10.0;
const PROGRESS_STATS: f32 = 15.0;
const PROGRESS_SCHEMA: f32 = 25.0;
const PROGRESS_ENCODE: f32 = encode::PROGRESS_START;
const PROGRESS_ANNOTATE: f32 = 50.0;
const PROGRESS_DONE: f32 = 100.0;

/// Parameters of one ingestion.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// The input file, plain or compressed.
    pub path_in: PathBuf,
    /// Where to write the decompressed working copy.
    pub path_decompressed: PathBuf,
    /// Where to create the store.
    pub path_store: PathBuf,
    pub chunk_size: usize,
    pub store_compression: StoreCompression,
    pub alt_tally: AltTallyPolicy,
    pub annotation: AnnotationSettings,
}

impl IngestRequest {
    /// Build a request from the settings, with the default paths.
    pub fn from_settings<P: AsRef<Path>>(
        path_in: P,
        settings: &Settings,
    ) -> Result<Self, anyhow::Error> {
        Ok(Self {
            path_in: path_in.as_ref().to_path_buf(),
            path_decompressed: settings.path_decompressed()?,
            path_store: settings.path_store()?,
            chunk_size: settings.chunk_size,
            store_compression: settings.store_compression,
            alt_tally: AltTallyPolicy::default(),
            annotation: settings.annotation.clone(),
        })
    }
}

/// What the first stages learned about the input, consumed by the later ones.
#[derive(Debug, Clone)]
struct IngestContext {
    compression: Compression,
    validation: Validation,
    metadata: Vec<header::HeaderMetadataEntry>,
    statistics: VariantStatistics,
    schema: schema::SchemaSummary,
}

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    pub compression: Compression,
    /// Number of rows in the stored table.
    pub row_count: u64,
    /// Number of columns in the stored table.
    pub column_count: usize,
    /// Number of descriptive metadata entries stored.
    pub metadata_count: usize,
    pub statistics: VariantStatistics,
    /// Whether the annotation step replaced the table.
    pub annotated: bool,
}

/// Check that `path` is an existing, non-empty file.
pub fn verify_file<P: AsRef<Path>>(path: P) -> Result<u64, IngestError> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path).map_err(|e| IngestError::file_access(path, e))?;
    if !metadata.is_file() {
        return Err(IngestError::FileAccess {
            path: path.to_owned(),
            reason: String::from("not a regular file"),
        });
    }
    if metadata.len() == 0 {
        return Err(IngestError::FileAccess {
            path: path.to_owned(),
            reason: String::from("file is empty"),
        });
    }
    Ok(metadata.len())
}

/// Reject input whose first non-empty line does not look like a VCF header.
fn check_looks_like_vcf<S: AsRef<str>>(path: &Path, lines: &[S]) -> Result<(), IngestError> {
    match lines.iter().map(|l| l.as_ref().trim()).find(|l| !l.is_empty()) {
        Some(line) if !line.starts_with('#') => Err(IngestError::UnknownFormat {
            path: path.to_owned(),
        }),
        _ => Ok(()),
    }
}

/// Run the stages up to and including the schema pass.
fn analyze(
    request: &IngestRequest,
    reporter: &mut dyn Reporter,
) -> Result<IngestContext, IngestError> {
    reporter.progress(PROGRESS_VERIFY_FILE, "Verifying file");
    let size = verify_file(&request.path_in)?;
    tracing::debug!("input {:?} has {} bytes", &request.path_in, size.separate_with_commas());

    let compression = Compression::sniff(&request.path_in)?;
    reporter.progress(
        PROGRESS_VERIFY_VCF,
        &format!("Verifying VCF (detected {})", compression.label()),
    );
    let head = cio::head_lines(&request.path_in, compression, HEAD_LINES)?;
    check_looks_like_vcf(&request.path_in, &head)?;
    let validation = validate::validate(&head)?;
    if let Some(warning) = validation.warning() {
        reporter.warning(&warning);
    }

    reporter.progress(PROGRESS_DECOMPRESS, "Decompressing VCF");
    if let Some(parent) = request.path_decompressed.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IngestError::file_access(parent, e))?;
    }
    let band = ProgressBand::new(PROGRESS_DECOMPRESS, PROGRESS_METADATA);
    cio::decompress_to(
        &request.path_in,
        compression,
        &request.path_decompressed,
        &mut |done, total| reporter.progress(band.at(done, total), "Decompressing VCF"),
    )?;
    let path = request.path_decompressed.as_path();

    reporter.progress(PROGRESS_METADATA, "Extracting metadata");
    let metadata = header::extract_metadata(cio::open_read(path, Compression::None)?)
        .map_err(|e| IngestError::file_access(path, e))?;
    tracing::debug!("extracted {} metadata entries", metadata.len());

    reporter.progress(PROGRESS_STATS, "Computing statistics");
    let before_stats = std::time::Instant::now();
    let statistics = stats::compute(
        path,
        &validation.layout,
        request.alt_tally,
        request.chunk_size,
        reporter,
        ProgressBand::new(PROGRESS_STATS, PROGRESS_SCHEMA),
    )?;
    tracing::debug!(
        "statistics over {} variants computed in {:?}",
        statistics.variant_count().separate_with_commas(),
        before_stats.elapsed()
    );

    reporter.progress(PROGRESS_SCHEMA, "Deriving column schema");
    let schema = schema::derive(
        path,
        &validation,
        request.chunk_size,
        reporter,
        ProgressBand::new(PROGRESS_SCHEMA, PROGRESS_ENCODE),
    )?;
    tracing::debug!(
        "derived {} columns over {} records",
        schema.schema.columns.len(),
        schema.row_count.separate_with_commas()
    );
    common::trace_rss_now();

    Ok(IngestContext {
        compression,
        validation,
        metadata,
        statistics,
        schema,
    })
}

/// Write metadata, statistics and the encoded table into the freshly created `store`.
fn fill_store(
    request: &IngestRequest,
    ctx: &IngestContext,
    store: &VariantStore,
    reporter: &mut dyn Reporter,
) -> Result<(u64, usize), IngestError> {
    store.put_meta(META_INPUT_PATH, &request.path_in.to_string_lossy())?;
    store.put_meta(META_INPUT_COMPRESSION, &ctx.compression.to_string())?;

    let descriptive = header::descriptive(&ctx.metadata)
        .cloned()
        .collect::<Vec<_>>();
    store.write_metadata(&descriptive)?;
    store.write_stats(&ctx.statistics.to_rows())?;

    let row_count = encode::encode(
        &request.path_decompressed,
        &ctx.validation,
        &ctx.schema.schema,
        ctx.schema.row_count,
        request.chunk_size,
        store,
        reporter,
    )?;
    Ok((row_count, descriptive.len()))
}

/// Run the whole pipeline; `annotator` enables the annotation step.
fn run_pipeline(
    request: &IngestRequest,
    annotator: Option<&dyn AnnotationSource>,
    reporter: &mut dyn Reporter,
) -> Result<IngestSummary, IngestError> {
    let ctx = analyze(request, reporter)?;

    // refuses to replace anything but an empty directory or a previous store
    let store = VariantStore::create(&request.path_store, request.store_compression)?;
    let (mut row_count, metadata_count) = match fill_store(request, &ctx, &store, reporter) {
        Ok(result) => result,
        Err(e) => {
            // the store was created above, do not leave it half-written
            drop(store);
            if let Err(e_rm) = std::fs::remove_dir_all(&request.path_store) {
                tracing::debug!("could not remove {:?}: {}", &request.path_store, e_rm);
            }
            return Err(e);
        }
    };
    let mut column_count = ctx.schema.schema.columns.len();

    let mut annotated = false;
    if let Some(annotator) = annotator {
        reporter.progress(PROGRESS_ANNOTATE, "Annotating variants");
        match annotate::annotate_store(
            &store,
            annotator,
            &request.annotation,
            request.chunk_size,
            reporter,
        ) {
            Ok(outcome) => {
                annotated = true;
                row_count = outcome.written_rows;
                column_count += outcome.columns.len();
            }
            Err(e) => {
                reporter.warning(&format!(
                    "Annotation failed, using non-annotated data: {}",
                    e
                ));
            }
        }
    }

    store.compact()?;
    if let Err(e) = std::fs::remove_file(&request.path_decompressed) {
        tracing::debug!(
            "could not remove working copy {:?}: {}",
            &request.path_decompressed,
            e
        );
    }
    reporter.progress(PROGRESS_DONE, "Done");

    Ok(IngestSummary {
        compression: ctx.compression,
        row_count,
        column_count,
        metadata_count,
        statistics: ctx.statistics,
        annotated,
    })
}

/// Ingest `request.path_in` into a new store at `request.path_store`.
///
/// A fatal error is reported through `reporter.error` before it is returned.
pub fn ingest(
    request: &IngestRequest,
    annotator: Option<&dyn AnnotationSource>,
    reporter: &mut dyn Reporter,
) -> Result<IngestSummary, IngestError> {
    run_pipeline(request, annotator, reporter).map_err(|e| {
        reporter.error(&e.to_string());
        e
    })
}

/// Command line arguments for `ingest` sub command.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Ingest a VCF file into a variant store", long_about = None)]
pub struct Args {
    /// Path to the input VCF file, may be gzip, bzip2 or xz compressed.
    #[arg(long)]
    pub path_in: String,
    /// Path to configuration file, defaults to `conf.toml` in the working directory.
    #[arg(long)]
    pub path_conf: Option<String>,
    /// Path to the variant store, defaults to the store in the working directory.
    #[arg(long)]
    pub path_store: Option<String>,
    /// Number of records per chunk, overrides the configuration.
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Block compression of the store, overrides the configuration.
    #[arg(long, value_enum)]
    pub store_compression: Option<StoreCompression>,
    /// Annotate the variants after ingestion.
    #[arg(long, default_value_t = false)]
    pub annotate: bool,
    /// When to tally the `ALT` values.
    #[arg(long, value_enum, default_value_t = AltTallyPolicy::default())]
    pub alt_tally: AltTallyPolicy,
}

/// Main entry point for `ingest` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let mut settings = Settings::load(args.path_conf.as_deref())?;
    if let Some(chunk_size) = args.chunk_size {
        settings.chunk_size = chunk_size;
    }
    if let Some(store_compression) = args.store_compression {
        settings.store_compression = store_compression;
    }
    settings.annotate = settings.annotate || args.annotate;
    settings.check()?;

    let mut request = IngestRequest::from_settings(&args.path_in, &settings)?;
    request.alt_tally = args.alt_tally;
    if let Some(path_store) = &args.path_store {
        request.path_store = PathBuf::from(path_store);
    }

    let client = if settings.annotate {
        Some(VepClient::new(&settings.annotation))
    } else {
        None
    };
    let summary = ingest(
        &request,
        client.as_ref().map(|c| c as &dyn AnnotationSource),
        &mut TracingReporter,
    )
    .map_err(|e| anyhow::anyhow!("could not ingest {}: {}", &args.path_in, e))?;

    tracing::info!(
        "stored {} rows with {} columns ({} compressed input) in {:?}",
        summary.row_count.separate_with_commas(),
        summary.column_count,
        summary.compression,
        &request.path_store
    );
    tracing::info!(
        "{} SNPs, {} indels on {} chromosomes{}",
        summary.statistics.total_snp_count.separate_with_commas(),
        summary.statistics.total_indel_count.separate_with_commas(),
        summary.statistics.per_chrom.len(),
        if summary.annotated { ", annotated" } else { "" }
    );
    common::trace_rss_now();

    tracing::info!(
        "All of `ingest` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}
