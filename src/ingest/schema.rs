//! Derivation of the fixed column schema of the persisted table.
//!
//! The schema pass streams the raw file in chunks, collects the union of all
//! `INFO` keys and decides the type of every column before the first row is
//! written.  The encoder then applies the fixed schema chunk by chunk.

use std::{
    collections::{BTreeMap, HashMap},
    io::BufRead,
    path::Path,
};

use thousands::Separable;

use crate::{
    common::io::{open_read, Compression},
    err::IngestError,
    ingest::{
        report::{ProgressBand, Reporter},
        validate::Validation,
    },
};

/// Name of the `#CHROM` column in the persisted table.
pub const CHROM_COLUMN: &str = "CHROM";

/// Value of bare `INFO` flags.
pub const FLAG_VALUE: &str = "True";

/// Characters that separate multiple values in one cell.
pub const MULTI_VALUE_SEPARATORS: &[char] = &[',', ';', '|'];

/// Fixed columns that are never numeric, by their persisted name.
pub const TEXT_COLUMNS: &[&str] = &[CHROM_COLUMN, "ID", "REF", "ALT", "FILTER", "INFO"];

/// Type of a persisted column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Text,
}

/// Where the values of a column come from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ColumnSource {
    /// Field with the given index of the raw data line.
    Fixed(usize),
    /// Key of the `INFO` column.
    Info(String),
    /// Field of the external annotation.
    Annotation(String),
}

/// One column of the persisted table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub source: ColumnSource,
}

impl ColumnSpec {
    /// Whether the column gets an index for fast lookups.
    pub fn is_indexed(&self) -> bool {
        !matches!(self.source, ColumnSource::Info(_))
    }
}

/// The column set of the persisted table, identical for every row.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DerivedColumnSchema {
    pub columns: Vec<ColumnSpec>,
}

impl DerivedColumnSchema {
    /// Position of the column with the given name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// Column with the given name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// All column names in order.
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// Map from `INFO` key to column position.
    pub fn info_positions(&self) -> HashMap<&str, usize> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, column)| match &column.source {
                ColumnSource::Info(key) => Some((key.as_str(), i)),
                _ => None,
            })
            .collect()
    }
}

/// Whether a raw value is the missing value marker.
pub fn is_missing(value: &str) -> bool {
    value.is_empty() || value == "."
}

/// Whether a raw value counts as a number.
///
/// Values with a multi-value separator are never numbers.  Non-finite values
/// such as `nan` or `inf` are treated as text.
pub fn is_numeric_value(value: &str) -> bool {
    !value.contains(MULTI_VALUE_SEPARATORS)
        && value.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

/// Split an `INFO` value into key/value pairs; bare flags get `FLAG_VALUE`.
pub fn parse_info(info: &str) -> impl Iterator<Item = (&str, &str)> {
    info.split(';')
        .map(str::trim)
        .filter(|token| !is_missing(token))
        .map(|token| token.split_once('=').unwrap_or((token, FLAG_VALUE)))
}

/// Persisted name of the raw header column `name`.
fn persisted_name(name: &str) -> &str {
    if name == "#CHROM" {
        CHROM_COLUMN
    } else {
        name
    }
}

/// Tracks whether every non-missing value of a column is a number.
#[derive(Debug, Clone, Copy)]
struct ColumnTyper {
    numeric: bool,
}

impl Default for ColumnTyper {
    fn default() -> Self {
        Self { numeric: true }
    }
}

impl ColumnTyper {
    fn push(&mut self, value: &str) {
        if self.numeric && !is_missing(value) && !is_numeric_value(value) {
            self.numeric = false;
        }
    }

    fn kind(&self) -> ColumnKind {
        if self.numeric {
            ColumnKind::Numeric
        } else {
            ColumnKind::Text
        }
    }
}

/// Incremental schema derivation over data records.
#[derive(Debug)]
pub struct SchemaDeriver {
    names: Vec<String>,
    info: usize,
    fixed: Vec<ColumnTyper>,
    info_keys: BTreeMap<String, ColumnTyper>,
    row_count: usize,
}

impl SchemaDeriver {
    pub fn new(validation: &Validation) -> Self {
        let names = validation
            .layout
            .names
            .iter()
            .map(|name| persisted_name(name).to_owned())
            .collect::<Vec<_>>();
        Self {
            fixed: vec![ColumnTyper::default(); names.len()],
            names,
            info: validation.layout.info,
            info_keys: BTreeMap::new(),
            row_count: 0,
        }
    }

    /// Account for one data record.
    pub fn push<'a, I>(&mut self, fields: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.row_count += 1;
        for (i, value) in fields.into_iter().enumerate() {
            if let Some(typer) = self.fixed.get_mut(i) {
                typer.push(value);
            }
            if i == self.info {
                for (key, value) in parse_info(value) {
                    if let Some(typer) = self.info_keys.get_mut(key) {
                        typer.push(value);
                    } else {
                        let mut typer = ColumnTyper::default();
                        typer.push(value);
                        self.info_keys.insert(key.to_owned(), typer);
                    }
                }
            }
        }
    }

    /// Number of records seen so far.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Fix the schema: raw columns first, then the sorted `INFO` keys.
    pub fn finish(self) -> DerivedColumnSchema {
        let mut columns = self
            .names
            .iter()
            .zip(self.fixed.iter())
            .enumerate()
            .map(|(i, (name, typer))| ColumnSpec {
                kind: if TEXT_COLUMNS.contains(&name.as_str()) {
                    ColumnKind::Text
                } else {
                    typer.kind()
                },
                name: name.clone(),
                source: ColumnSource::Fixed(i),
            })
            .collect::<Vec<_>>();
        for (key, typer) in self.info_keys {
            let name = if self.names.contains(&key) {
                format!("INFO_{}", key)
            } else {
                key.clone()
            };
            columns.push(ColumnSpec {
                name,
                kind: typer.kind(),
                source: ColumnSource::Info(key),
            });
        }
        DerivedColumnSchema { columns }
    }
}

/// Chunked reader over the data records of a decompressed VCF file.
pub struct RecordChunks {
    reader: csv::Reader<Box<dyn BufRead>>,
    header_bytes: u64,
    chunk_size: usize,
    done: bool,
}

impl RecordChunks {
    /// Open `path` and skip the `header_line_count` header lines.
    pub fn open<P: AsRef<Path>>(
        path: P,
        header_line_count: usize,
        chunk_size: usize,
    ) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let mut reader = open_read(path, Compression::None)?;
        let mut buf = Vec::new();
        let mut header_bytes = 0;
        for _ in 0..header_line_count {
            buf.clear();
            header_bytes += reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| IngestError::file_access(path, e))? as u64;
        }
        let reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .comment(Some(b'#'))
            .from_reader(reader);
        Ok(Self {
            reader,
            header_bytes,
            chunk_size: chunk_size.max(1),
            done: false,
        })
    }

    /// Number of bytes of the file consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.header_bytes + self.reader.position().byte()
    }
}

impl Iterator for RecordChunks {
    type Item = Result<Vec<csv::StringRecord>, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.chunk_size);
        let mut record = csv::StringRecord::new();
        while chunk.len() < self.chunk_size {
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    if record.len() == 1 && record[0].trim().is_empty() {
                        continue;
                    }
                    chunk.push(record.clone());
                }
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.done = true;
                    let line_no = e.position().map(|p| p.line() as usize).unwrap_or_default();
                    return Some(Err(IngestError::Parse {
                        line_no,
                        reason: e.to_string(),
                    }));
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

/// Result of the schema pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSummary {
    pub schema: DerivedColumnSchema,
    /// Number of data records in the file.
    pub row_count: usize,
}

/// Run the schema pass over the decompressed file at `path`.
///
/// Progress within `band` is reported after every chunk.
pub fn derive<P: AsRef<Path>>(
    path: P,
    validation: &Validation,
    chunk_size: usize,
    reporter: &mut dyn Reporter,
    band: ProgressBand,
) -> Result<SchemaSummary, IngestError> {
    let path = path.as_ref();
    let total = std::fs::metadata(path)
        .map_err(|e| IngestError::file_access(path, e))?
        .len();
    let mut deriver = SchemaDeriver::new(validation);
    let mut chunks = RecordChunks::open(path, validation.header_line_count, chunk_size)?;
    while let Some(chunk) = chunks.next() {
        for record in chunk? {
            deriver.push(record.iter());
        }
        reporter.progress(
            band.at(chunks.bytes_read(), total),
            &format!(
                "Deriving column schema: {} records",
                deriver.row_count().separate_with_commas()
            ),
        );
    }
    let row_count = deriver.row_count();
    Ok(SchemaSummary {
        schema: deriver.finish(),
        row_count,
    })
}
