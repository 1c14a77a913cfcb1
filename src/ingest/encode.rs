//! Encoding of the raw records into rows of the persisted table.

use std::{collections::HashMap, path::Path};

use thousands::Separable;

use crate::{
    common::pad_chrom,
    err::IngestError,
    ingest::{
        report::Reporter,
        schema::{
            is_missing, parse_info, ColumnKind, ColumnSource, DerivedColumnSchema, RecordChunks,
            CHROM_COLUMN,
        },
        validate::Validation,
    },
    store::{ds::Cell, VariantStore},
};

/// Progress at the start of encoding.
pub const PROGRESS_START: f32 = 35.0;
/// Progress after the last chunk.
pub const PROGRESS_END: f32 = 43.0;
/// Progress while indexing.
pub const PROGRESS_INDEX: f32 = 46.0;

/// Convert one raw value to a cell of the given kind.
pub fn to_cell(value: &str, kind: ColumnKind) -> Result<Cell, String> {
    if is_missing(value) {
        return Ok(Cell::Missing);
    }
    match kind {
        ColumnKind::Numeric => value
            .parse::<f64>()
            .map(Cell::Number)
            .map_err(|e| format!("value {:?} of numeric column is not a number: {}", value, e)),
        ColumnKind::Text => Ok(Cell::Text(value.to_owned())),
    }
}

/// Maps raw records to rows with the fixed column set of a schema.
#[derive(Debug)]
pub struct RowEncoder<'a> {
    schema: &'a DerivedColumnSchema,
    info_positions: HashMap<&'a str, usize>,
    /// Raw field index of the `INFO` column.
    info_field: Option<usize>,
}

impl<'a> RowEncoder<'a> {
    pub fn new(schema: &'a DerivedColumnSchema) -> Self {
        let info_field = schema.columns.iter().find_map(|column| match column.source {
            ColumnSource::Fixed(i) if column.name == "INFO" => Some(i),
            _ => None,
        });
        Self {
            schema,
            info_positions: schema.info_positions(),
            info_field,
        }
    }

    /// Encode the raw fields of one record.
    ///
    /// Every `INFO` column starts out missing and is overwritten by the
    /// values present on this record.
    pub fn encode(&self, fields: &[&str]) -> Result<Vec<Cell>, String> {
        let mut row = vec![Cell::Missing; self.schema.columns.len()];
        for (cell, column) in row.iter_mut().zip(self.schema.columns.iter()) {
            if let ColumnSource::Fixed(i) = column.source {
                let value = fields.get(i).copied().unwrap_or_default();
                *cell = if column.name == CHROM_COLUMN {
                    to_cell(&pad_chrom(value), column.kind)?
                } else {
                    to_cell(value, column.kind)?
                };
            }
        }
        if let Some(info) = self.info_field.and_then(|i| fields.get(i)) {
            for (key, value) in parse_info(info) {
                if let Some(&pos) = self.info_positions.get(key) {
                    row[pos] = to_cell(value, self.schema.columns[pos].kind)?;
                }
            }
        }
        Ok(row)
    }
}

/// Encode the decompressed file at `path` into `store` chunk by chunk.
///
/// `row_count` is the number of records from the schema pass and only used
/// for progress reporting.  After the last chunk, the index is built.
pub fn encode<P: AsRef<Path>>(
    path: P,
    validation: &Validation,
    schema: &DerivedColumnSchema,
    row_count: usize,
    chunk_size: usize,
    store: &VariantStore,
    reporter: &mut dyn Reporter,
) -> Result<u64, IngestError> {
    store.write_schema(schema)?;

    let encoder = RowEncoder::new(schema);
    let n_chunks = row_count.div_ceil(chunk_size.max(1)).max(1);
    let mut written = 0;
    reporter.progress(PROGRESS_START, "Encoding variant store");
    for (chunk_no, chunk) in RecordChunks::open(path, validation.header_line_count, chunk_size)?
        .enumerate()
    {
        let chunk = chunk?;
        let rows = chunk
            .iter()
            .map(|record| {
                let fields = record.iter().collect::<Vec<_>>();
                encoder.encode(&fields).map_err(|reason| IngestError::Parse {
                    line_no: record
                        .position()
                        .map(|p| p.line() as usize)
                        .unwrap_or_default(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        written = store.append_rows(&rows)?;

        let percent = PROGRESS_START
            + ((chunk_no + 1) as f32 / n_chunks as f32).min(1.0) * (PROGRESS_END - PROGRESS_START);
        reporter.progress(
            percent,
            &format!(
                "Encoding variant store ({} rows)",
                written.separate_with_commas()
            ),
        );
    }

    reporter.progress(PROGRESS_INDEX, "Indexing variant store");
    let before_index = std::time::Instant::now();
    let entries = store.build_index(schema)?;
    tracing::debug!(
        "wrote {} index entries in {:?}",
        entries.separate_with_commas(),
        before_index.elapsed()
    );

    Ok(written)
}
