//! Optional annotation of the variant table with transcript consequences.
//!
//! Variant identifiers from the `ID` column are sent in batches to a VEP
//! compatible REST endpoint.  Each transcript consequence of the response is
//! merged back into the table by identifier and alternate allele, yielding
//! one row per consequence.  Rows without a match are kept with missing
//! values in all annotation columns.  The variant table is replaced in a
//! single write after all requests are done, so a failure leaves the store
//! untouched.

use std::collections::{BTreeSet, HashMap, HashSet};

use thousands::Separable;

use crate::{
    conf::{AnnotationSettings, Settings},
    err::IngestError,
    ingest::{
        report::{Reporter, TracingReporter},
        schema::{is_numeric_value, ColumnKind, ColumnSource, ColumnSpec, DerivedColumnSchema},
    },
    store::{ds::Cell, VariantStore, META_ANNOTATED},
};

/// Fields extracted from each transcript consequence.
pub const TRANSCRIPT_FIELDS: &[&str] = &[
    "impact",
    "consequence_terms",
    "gene_id",
    "gene_symbol",
    "biotype",
    "distance",
    "gene_symbol_source",
    "transcript_id",
    "cdna_start",
    "cdna_end",
];

/// Field extracted from the variant level.
pub const VARIANT_FIELD: &str = "most_severe_consequence";

/// Progress milestones of the annotation step.
const PROGRESS_REQUESTS: (f32, f32) = (51.0, 53.0);
const PROGRESS_MERGE: (f32, f32) = (54.0, 70.0);

/// Problems of the annotation step; all of them trigger the fallback to
/// the unannotated table.
#[derive(thiserror::Error, Debug)]
pub enum AnnotationError {
    #[error("no ids in VCF, aborting annotation")]
    NoIds,
    #[error("variant table has no ID column")]
    NoIdColumn,
    #[error("all {batches} annotation requests failed, last error: {reason}")]
    AllBatchesFailed { batches: usize, reason: String },
    #[error("annotation request failed: {0}")]
    Request(String),
    #[error("could not parse annotation response: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] IngestError),
}

/// One annotated variant of the response.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct VepVariant {
    /// The identifier that was sent.
    pub id: String,
    #[serde(default)]
    pub most_severe_consequence: Option<String>,
    #[serde(default)]
    pub transcript_consequences: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Source of annotations for a batch of identifiers.
pub trait AnnotationSource {
    fn annotate(&self, ids: &[String]) -> Result<Vec<VepVariant>, AnnotationError>;
}

/// Client for a VEP REST endpoint.
///
/// A client that could not be built fails every request, so the problem
/// surfaces as failed annotation instead of aborting the caller.
#[derive(Debug)]
pub struct VepClient {
    client: Result<reqwest::blocking::Client, String>,
    endpoint: String,
}

impl VepClient {
    pub fn new(settings: &AnnotationSettings) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e));
        if let Err(e) = &client {
            tracing::warn!("{}", e);
        }
        Self {
            client,
            endpoint: settings.endpoint.clone(),
        }
    }
}

impl AnnotationSource for VepClient {
    fn annotate(&self, ids: &[String]) -> Result<Vec<VepVariant>, AnnotationError> {
        let client = self
            .client
            .as_ref()
            .map_err(|e| AnnotationError::Request(e.clone()))?;
        let response = client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .map_err(|e| AnnotationError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AnnotationError::Request(format!(
                "HTTP {} from {}",
                response.status(),
                &self.endpoint
            )));
        }
        response
            .json::<Vec<VepVariant>>()
            .map_err(|e| AnnotationError::Parse(e.to_string()))
    }
}

/// Summary of a successful annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationOutcome {
    pub batches: usize,
    pub failed_batches: usize,
    /// Number of input rows with at least one consequence.
    pub matched_rows: usize,
    /// Number of rows in the new table.
    pub written_rows: u64,
    /// Names of the annotation columns in the new table.
    pub columns: Vec<String>,
}

/// Send `ids` in batches, retrying each failed batch with exponential backoff.
///
/// Returns the variants of the successful batches and the number of failed
/// batches; fails only if no batch succeeds.
fn fetch_batches(
    source: &dyn AnnotationSource,
    ids: &[String],
    settings: &AnnotationSettings,
    reporter: &mut dyn Reporter,
) -> Result<(Vec<VepVariant>, usize, usize), AnnotationError> {
    let batches = ids.chunks(settings.batch_size.max(1)).collect::<Vec<_>>();
    let mut variants = Vec::new();
    let mut failed = 0;
    let mut last_error = String::new();
    for (i, batch) in batches.iter().enumerate() {
        let percent = PROGRESS_REQUESTS.0
            + (i as f32 / batches.len() as f32) * (PROGRESS_REQUESTS.1 - PROGRESS_REQUESTS.0);
        reporter.progress(
            percent,
            &format!("Annotation: request {}/{}", i + 1, batches.len()),
        );

        let mut backoff = std::time::Duration::from_millis(settings.retry_backoff_ms);
        let mut attempt = 0;
        loop {
            match source.annotate(batch) {
                Ok(result) => {
                    variants.extend(result);
                    break;
                }
                Err(e) if attempt < settings.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        "request {} failed ({}), retry {} in {:?}",
                        i + 1,
                        e,
                        attempt,
                        backoff
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => {
                    tracing::warn!("request {} failed, skipping batch: {}", i + 1, e);
                    last_error = e.to_string();
                    failed += 1;
                    break;
                }
            }
        }
    }

    if failed == batches.len() {
        return Err(AnnotationError::AllBatchesFailed {
            batches: batches.len(),
            reason: last_error,
        });
    }
    if failed > 0 {
        reporter.warning(&format!(
            "{} of {} annotation requests failed, only doing partial annotation",
            failed,
            batches.len()
        ));
    }
    Ok((variants, batches.len(), failed))
}

/// Render a JSON value as cell text, `None` for null.
fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(true) => Some(String::from("True")),
        serde_json::Value::Bool(false) => Some(String::from("False")),
        other => Some(other.to_string()),
    }
}

/// Annotation values of one transcript consequence by column name.
///
/// List values are spread over `FIELD`, `FIELD_1`, `FIELD_2`, ...
fn consequence_values(
    variant: &VepVariant,
    consequence: &serde_json::Map<String, serde_json::Value>,
    columns: &mut BTreeSet<String>,
) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for field in TRANSCRIPT_FIELDS {
        let column = field.to_uppercase();
        match consequence.get(*field) {
            Some(serde_json::Value::Array(values)) => {
                for (i, value) in values.iter().enumerate() {
                    let name = if i == 0 {
                        column.clone()
                    } else {
                        format!("{}_{}", column, i)
                    };
                    if let Some(text) = json_text(value) {
                        result.insert(name.clone(), text);
                    }
                    columns.insert(name);
                }
            }
            Some(value) => {
                if let Some(text) = json_text(value) {
                    result.insert(column.clone(), text);
                }
            }
            None => (),
        }
        columns.insert(column);
    }
    if let Some(most_severe) = &variant.most_severe_consequence {
        result.insert(VARIANT_FIELD.to_uppercase(), most_severe.clone());
    }
    columns.insert(VARIANT_FIELD.to_uppercase());
    result
}

/// Annotate the variant table of `store` in place.
pub fn annotate_store(
    store: &VariantStore,
    source: &dyn AnnotationSource,
    settings: &AnnotationSettings,
    chunk_size: usize,
    reporter: &mut dyn Reporter,
) -> Result<AnnotationOutcome, AnnotationError> {
    let schema = store.schema()?;
    let id_col = schema.position("ID").ok_or(AnnotationError::NoIdColumn)?;
    let alt_col = schema.position("ALT");
    let rows = store.rows()?;

    let mut seen = HashSet::new();
    let ids = rows
        .iter()
        .filter_map(|(_, row)| match &row[id_col] {
            Cell::Text(id) if seen.insert(id.clone()) => Some(id.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    if ids.is_empty() {
        return Err(AnnotationError::NoIds);
    }
    tracing::info!("annotating {} ids", ids.len().separate_with_commas());

    let (variants, batches, failed_batches) = fetch_batches(source, &ids, settings, reporter)?;

    reporter.progress(PROGRESS_MERGE.0, "Annotation: parsing responses");
    let mut columns = BTreeSet::new();
    let mut by_key: HashMap<(String, String), Vec<HashMap<String, String>>> = HashMap::new();
    for variant in &variants {
        for consequence in &variant.transcript_consequences {
            let Some(allele) = consequence.get("variant_allele").and_then(json_text) else {
                continue;
            };
            let values = consequence_values(variant, consequence, &mut columns);
            by_key
                .entry((variant.id.clone(), allele))
                .or_default()
                .push(values);
        }
    }

    // annotation column names that clash with table columns get a prefix
    let columns = columns.into_iter().collect::<Vec<_>>();
    let names = columns
        .iter()
        .map(|column| {
            if schema.position(column).is_some() {
                format!("VEP_{}", column)
            } else {
                column.clone()
            }
        })
        .collect::<Vec<_>>();

    let mut matched_rows = 0;
    let mut new_rows: Vec<(Vec<Cell>, Vec<Option<String>>)> = Vec::new();
    for (_, row) in rows {
        let alleles = match alt_col.map(|c| &row[c]) {
            Some(Cell::Text(alt)) => alt.split(',').map(String::from).collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        let matches = match &row[id_col] {
            Cell::Text(id) => alleles
                .iter()
                .filter_map(|allele| by_key.get(&(id.clone(), allele.clone())))
                .flatten()
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        if matches.is_empty() {
            new_rows.push((row, vec![None; columns.len()]));
        } else {
            matched_rows += 1;
            for values in matches {
                let extra = columns
                    .iter()
                    .map(|column| values.get(column).cloned())
                    .collect();
                new_rows.push((row.clone(), extra));
            }
        }
    }

    // type the annotation columns and drop the ones without any value
    let mut new_schema = schema.clone();
    let mut kept = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let values = new_rows.iter().filter_map(|(_, extra)| extra[i].as_deref());
        let mut any = false;
        let mut numeric = true;
        for value in values {
            any = true;
            numeric = numeric && is_numeric_value(value);
        }
        if !any {
            tracing::debug!("dropping annotation column {} without values", name);
            continue;
        }
        kept.push(i);
        new_schema.columns.push(ColumnSpec {
            name: name.clone(),
            kind: if numeric {
                ColumnKind::Numeric
            } else {
                ColumnKind::Text
            },
            source: ColumnSource::Annotation(columns[i].to_lowercase()),
        });
    }

    let chunk_size = chunk_size.max(1);
    let n_chunks = new_rows.len().div_ceil(chunk_size).max(1);
    let mut table = Vec::with_capacity(new_rows.len());
    for (chunk_no, chunk) in new_rows.chunks(chunk_size).enumerate() {
        for (row, extra) in chunk {
            let mut row = row.clone();
            for &i in &kept {
                let kind = new_schema.columns[row.len()].kind;
                row.push(match (&extra[i], kind) {
                    (None, _) => Cell::Missing,
                    (Some(value), ColumnKind::Numeric) => {
                        value.parse().map(Cell::Number).unwrap_or(Cell::Missing)
                    }
                    (Some(value), ColumnKind::Text) => Cell::Text(value.clone()),
                });
            }
            table.push(row);
        }
        let percent = PROGRESS_MERGE.0
            + 1.0
            + ((chunk_no + 1) as f32 / n_chunks as f32) * (PROGRESS_MERGE.1 - PROGRESS_MERGE.0 - 2.0);
        reporter.progress(percent, "Annotation: merging annotations");
    }

    reporter.progress(PROGRESS_MERGE.1, "Annotation: writing annotated table");
    let entries = store.replace_table(&new_schema, &table, &[(META_ANNOTATED, "true")])?;
    tracing::debug!("wrote {} index entries", entries.separate_with_commas());

    Ok(AnnotationOutcome {
        batches,
        failed_batches,
        matched_rows,
        written_rows: table.len() as u64,
        columns: kept.iter().map(|&i| names[i].clone()).collect(),
    })
}

/// Command line arguments for `annotate` sub command.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Annotate the variant table of a store", long_about = None)]
pub struct Args {
    /// Path to configuration file, defaults to `conf.toml` in the working directory.
    #[arg(long)]
    pub path_conf: Option<String>,
    /// Path to the variant store, defaults to the store in the working directory.
    #[arg(long)]
    pub path_store: Option<String>,
    /// Override the annotation endpoint.
    #[arg(long)]
    pub endpoint: Option<String>,
}

/// Main entry point for `annotate` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let mut settings = Settings::load(args.path_conf.as_deref())?;
    if let Some(endpoint) = &args.endpoint {
        settings.annotation.endpoint = endpoint.clone();
    }
    let path_store = match &args.path_store {
        Some(path) => std::path::PathBuf::from(path),
        None => settings.path_store()?,
    };

    let store = VariantStore::open(&path_store)
        .map_err(|e| anyhow::anyhow!("could not open store: {}", e))?;
    let client = VepClient::new(&settings.annotation);
    let outcome = annotate_store(
        &store,
        &client,
        &settings.annotation,
        settings.chunk_size,
        &mut TracingReporter,
    )?;
    tracing::info!(
        "annotated {} rows into {} rows with columns {:?}",
        outcome.matched_rows.separate_with_commas(),
        outcome.written_rows.separate_with_commas(),
        &outcome.columns
    );

    tracing::info!(
        "All of `annotate` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;
    use temp_testdir::TempDir;

    use super::*;
    use crate::{conf::StoreCompression, ingest::report::RecordingReporter};

    /// Answers from a fixed map and fails the given calls.
    #[derive(Default)]
    struct MockSource {
        variants: Vec<VepVariant>,
        failing_calls: HashSet<usize>,
        calls: RefCell<usize>,
    }

    impl AnnotationSource for MockSource {
        fn annotate(&self, ids: &[String]) -> Result<Vec<VepVariant>, AnnotationError> {
            let call = *self.calls.borrow();
            *self.calls.borrow_mut() += 1;
            if self.failing_calls.contains(&call) {
                return Err(AnnotationError::Request(String::from("timeout")));
            }
            Ok(self
                .variants
                .iter()
                .filter(|v| ids.contains(&v.id))
                .cloned()
                .collect())
        }
    }

    fn variant(id: &str, consequences: serde_json::Value) -> VepVariant {
        VepVariant {
            id: id.to_owned(),
            most_severe_consequence: Some(String::from("missense_variant")),
            transcript_consequences: serde_json::from_value(consequences).unwrap(),
        }
    }

    fn settings() -> AnnotationSettings {
        AnnotationSettings {
            batch_size: 1,
            max_retries: 1,
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn store_with_rows(tmp_dir: &TempDir) -> Result<VariantStore, anyhow::Error> {
        let spec = |name: &str, kind, i| ColumnSpec {
            name: name.to_owned(),
            kind,
            source: ColumnSource::Fixed(i),
        };
        let schema = DerivedColumnSchema {
            columns: vec![
                spec("CHROM", ColumnKind::Text, 0),
                spec("POS", ColumnKind::Numeric, 1),
                spec("ID", ColumnKind::Text, 2),
                spec("ALT", ColumnKind::Text, 3),
            ],
        };
        let store = VariantStore::create(tmp_dir.join("store"), StoreCompression::Lz4)?;
        store.write_schema(&schema)?;
        let row = |pos: f64, id: Option<&str>, alt: &str| {
            vec![
                Cell::Text(String::from("01")),
                Cell::Number(pos),
                id.map(|id| Cell::Text(id.to_owned())).unwrap_or(Cell::Missing),
                Cell::Text(alt.to_owned()),
            ]
        };
        store.append_rows(&[
            row(100.0, Some("rs1"), "G"),
            row(200.0, Some("rs2"), "T"),
            row(300.0, None, "C"),
        ])?;
        store.build_index(&schema)?;
        Ok(store)
    }

    #[test]
    fn merge_by_id_and_allele() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let store = store_with_rows(&tmp_dir)?;
        let source = MockSource {
            variants: vec![
                variant(
                    "rs1",
                    serde_json::json!([
                        {"variant_allele": "G", "impact": "MODERATE", "gene_symbol": "BRCA1",
                         "consequence_terms": ["missense_variant", "splice_region_variant"],
                         "distance": 12},
                        {"variant_allele": "G", "impact": "LOW", "gene_symbol": "NBR2",
                         "consequence_terms": ["intron_variant"]},
                        {"variant_allele": "A", "impact": "HIGH"}
                    ]),
                ),
                variant("rs2", serde_json::json!([{"variant_allele": "A", "impact": "HIGH"}])),
            ],
            ..Default::default()
        };
        let mut reporter = RecordingReporter::default();

        let outcome = annotate_store(&store, &source, &settings(), 2, &mut reporter)?;

        assert_eq!(outcome.batches, 2);
        assert_eq!(outcome.failed_batches, 0);
        assert_eq!(outcome.matched_rows, 1);
        assert_eq!(outcome.written_rows, 4);
        assert_eq!(
            outcome.columns,
            vec![
                "CONSEQUENCE_TERMS",
                "CONSEQUENCE_TERMS_1",
                "DISTANCE",
                "GENE_SYMBOL",
                "IMPACT",
                "MOST_SEVERE_CONSEQUENCE"
            ]
        );
        assert!(reporter.warnings().is_empty());

        let schema = store.schema()?;
        assert_eq!(
            schema.column("DISTANCE").map(|c| c.kind),
            Some(ColumnKind::Numeric)
        );
        let rows = store.rows()?;
        let impact = schema.position("IMPACT").unwrap();
        let terms_1 = schema.position("CONSEQUENCE_TERMS_1").unwrap();
        assert_eq!(
            rows.iter()
                .map(|(_, row)| row[impact].to_string())
                .collect::<Vec<_>>(),
            vec!["MODERATE", "LOW", ".", "."]
        );
        assert_eq!(
            rows[0].1[terms_1],
            Cell::Text(String::from("splice_region_variant"))
        );
        assert_eq!(store.meta(META_ANNOTATED)?.as_deref(), Some("true"));
        assert_eq!(
            store.lookup_eq(impact, &Cell::Text(String::from("low")))?,
            vec![1]
        );

        Ok(())
    }

    #[test]
    fn partial_failure_warns_and_retries() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let store = store_with_rows(&tmp_dir)?;
        // call 0 fails and is retried as call 1; calls 2 and 3 fail for the second batch
        let source = MockSource {
            variants: vec![variant(
                "rs1",
                serde_json::json!([{"variant_allele": "G", "impact": "MODERATE"}]),
            )],
            failing_calls: [0, 2, 3].into_iter().collect(),
            ..Default::default()
        };
        let mut reporter = RecordingReporter::default();

        let outcome = annotate_store(&store, &source, &settings(), 10, &mut reporter)?;

        assert_eq!(*source.calls.borrow(), 4);
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.matched_rows, 1);
        assert_eq!(reporter.warnings().len(), 1);

        Ok(())
    }

    #[test]
    fn all_failed_leaves_store_untouched() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let store = store_with_rows(&tmp_dir)?;
        let source = MockSource {
            failing_calls: (0..10).collect(),
            ..Default::default()
        };
        let mut reporter = RecordingReporter::default();

        let result = annotate_store(&store, &source, &settings(), 10, &mut reporter);

        assert!(matches!(
            result,
            Err(AnnotationError::AllBatchesFailed { batches: 2, .. })
        ));
        assert_eq!(store.row_count()?, 3);
        assert_eq!(store.schema()?.columns.len(), 4);

        Ok(())
    }

    #[test]
    fn unbuilt_client_fails_every_batch() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let store = store_with_rows(&tmp_dir)?;
        let client = VepClient {
            client: Err(String::from("failed to build HTTP client: no TLS backend")),
            endpoint: String::from("http://localhost:1/vep"),
        };
        let mut reporter = RecordingReporter::default();

        let result = annotate_store(&store, &client, &settings(), 10, &mut reporter);

        match result {
            Err(AnnotationError::AllBatchesFailed { batches, reason }) => {
                assert_eq!(batches, 2);
                assert!(reason.contains("no TLS backend"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(store.row_count()?, 3);
        assert_eq!(store.meta(META_ANNOTATED)?, None);

        Ok(())
    }

    #[test]
    fn no_ids() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let store = VariantStore::create(tmp_dir.join("store"), StoreCompression::Lz4)?;
        store.write_schema(&DerivedColumnSchema {
            columns: vec![ColumnSpec {
                name: String::from("ID"),
                kind: ColumnKind::Text,
                source: ColumnSource::Fixed(0),
            }],
        })?;
        store.append_rows(&[vec![Cell::Missing]])?;
        let mut reporter = RecordingReporter::default();

        let result = annotate_store(
            &store,
            &MockSource::default(),
            &settings(),
            10,
            &mut reporter,
        );

        assert!(matches!(result, Err(AnnotationError::NoIds)));

        Ok(())
    }
}
