//! Translation of the filter grammar into predicates and their evaluation.
//!
//! The grammar knows a single value (`01`), a comma-separated set of values
//! (`01,02,X`), and a dash-separated closed range (`100-200`).  Whitespace is
//! removed and the text is folded to upper case before parsing.

use std::io::Write;

use thousands::Separable;

use crate::{
    common::{self, pad_chrom},
    conf::Settings,
    err::IngestError,
    ingest::schema::{ColumnKind, DerivedColumnSchema, CHROM_COLUMN},
    store::{ds::Cell, VariantStore},
};

/// Rejections of the filter grammar.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("use either comma-separated values or a dash-separated range")]
    MixedSeparators,
    #[error("enter exactly 2 values separated by a dash, got {0:?}")]
    BadRange(String),
    #[error("enter 1 or more values separated by a comma")]
    NoValues,
    #[error("can only filter a dash-separated range on numeric columns, {column:?} is not numeric")]
    NotNumeric { column: String },
    #[error("value {value:?} is not a number but column {column:?} is numeric")]
    NotANumber { column: String, value: String },
    #[error("unknown column {column:?}, available: {available:?}")]
    UnknownColumn {
        column: String,
        available: Vec<String>,
    },
}

/// A predicate over the rows of the persisted table.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// No filter.
    All,
    /// `column == value`.
    Eq { column: usize, value: Cell },
    /// `column == v1 OR column == v2 OR ...`.
    AnyOf { column: usize, values: Vec<Cell> },
    /// `column >= lo AND column <= hi`.
    Range { column: usize, lo: f64, hi: f64 },
}

/// Equality of a stored cell and a filter value; text is compared ignoring case.
fn cell_matches(cell: &Cell, value: &Cell) -> bool {
    match (cell, value) {
        (Cell::Number(a), Cell::Number(b)) => a == b,
        (Cell::Text(a), Cell::Text(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

impl Predicate {
    /// Whether `row` satisfies the predicate.
    pub fn matches(&self, row: &[Cell]) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq { column, value } => {
                row.get(*column).map_or(false, |cell| cell_matches(cell, value))
            }
            Predicate::AnyOf { column, values } => row
                .get(*column)
                .map_or(false, |cell| values.iter().any(|value| cell_matches(cell, value))),
            Predicate::Range { column, lo, hi } => row
                .get(*column)
                .and_then(Cell::as_number)
                .map_or(false, |x| *lo <= x && x <= *hi),
        }
    }

    /// Number of OR-ed clauses.
    pub fn clause_count(&self) -> usize {
        match self {
            Predicate::All => 0,
            Predicate::AnyOf { values, .. } => values.len(),
            Predicate::Eq { .. } | Predicate::Range { .. } => 1,
        }
    }
}

/// A translated filter with its human readable description.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub predicate: Predicate,
}

impl Filter {
    /// Status text describing the filter.
    pub fn describe(&self) -> String {
        match &self.predicate {
            Predicate::All => String::from("No Filter Selected"),
            Predicate::Eq { value, .. } => format!("Filtering to show {}: {}", self.column, value),
            Predicate::AnyOf { values, .. } => format!(
                "Filtering to show {}: {}",
                self.column,
                values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Predicate::Range { lo, hi, .. } => format!(
                "Filtering to show {} from {} to {}",
                self.column,
                common::format_number(*lo),
                common::format_number(*hi)
            ),
        }
    }
}

/// Parse a token into a filter value for the given column.
fn to_value(token: &str, column: &str, kind: ColumnKind) -> Result<Cell, FilterError> {
    match kind {
        ColumnKind::Numeric => token
            .parse::<f64>()
            .map(Cell::Number)
            .map_err(|_| FilterError::NotANumber {
                column: column.to_owned(),
                value: token.to_owned(),
            }),
        ColumnKind::Text if column == CHROM_COLUMN => Ok(Cell::Text(pad_chrom(token).into_owned())),
        ColumnKind::Text => Ok(Cell::Text(token.to_owned())),
    }
}

/// Translate the filter `text` on `column` into a predicate.
pub fn translate(
    text: &str,
    column: &str,
    schema: &DerivedColumnSchema,
) -> Result<Filter, FilterError> {
    let (position, spec) = schema
        .columns
        .iter()
        .enumerate()
        .find(|(_, spec)| spec.name == column)
        .ok_or_else(|| FilterError::UnknownColumn {
            column: column.to_owned(),
            available: schema.names().into_iter().map(String::from).collect(),
        })?;
    let text = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    let predicate = if text.contains('-') && text.contains(',') {
        return Err(FilterError::MixedSeparators);
    } else if text.contains('-') {
        if spec.kind != ColumnKind::Numeric {
            return Err(FilterError::NotNumeric {
                column: column.to_owned(),
            });
        }
        let tokens = text.split('-').filter(|t| !t.is_empty()).collect::<Vec<_>>();
        let [a, b] = tokens[..] else {
            return Err(FilterError::BadRange(text.clone()));
        };
        let parse = |token: &str| {
            token.parse::<f64>().map_err(|_| FilterError::NotANumber {
                column: column.to_owned(),
                value: token.to_owned(),
            })
        };
        let (a, b) = (parse(a)?, parse(b)?);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if lo == hi {
            Predicate::Eq {
                column: position,
                value: Cell::Number(lo),
            }
        } else {
            Predicate::Range {
                column: position,
                lo,
                hi,
            }
        }
    } else if text.contains(',') {
        let values = text
            .split(',')
            .filter(|t| !t.is_empty())
            .map(|token| to_value(token, column, spec.kind))
            .collect::<Result<Vec<_>, _>>()?;
        if values.is_empty() {
            return Err(FilterError::NoValues);
        }
        Predicate::AnyOf {
            column: position,
            values,
        }
    } else if text.is_empty() {
        Predicate::All
    } else {
        Predicate::Eq {
            column: position,
            value: to_value(&text, column, spec.kind)?,
        }
    };

    Ok(Filter {
        column: column.to_owned(),
        predicate,
    })
}

/// Select the rows matching `predicate`, in table order.
///
/// Uses the index of the column if there is one, else scans the table.
pub fn select(store: &VariantStore, predicate: &Predicate) -> Result<Vec<Vec<Cell>>, IngestError> {
    let indexed = store.indexed_columns()?;
    let row_ids = match predicate {
        Predicate::All => None,
        Predicate::Eq { column, value } if indexed.contains(column) => {
            Some(store.lookup_eq(*column, value)?)
        }
        Predicate::AnyOf { column, values } if indexed.contains(column) => {
            let mut ids = Vec::new();
            for value in values {
                ids.extend(store.lookup_eq(*column, value)?);
            }
            ids.sort_unstable();
            ids.dedup();
            Some(ids)
        }
        Predicate::Range { column, lo, hi } if indexed.contains(column) => {
            Some(store.lookup_range(*column, *lo, *hi)?)
        }
        _ => {
            tracing::debug!("no index for predicate {:?}, scanning table", predicate);
            let mut result = Vec::new();
            store.for_each_row(|_, row| {
                if predicate.matches(&row) {
                    result.push(row);
                }
                Ok(())
            })?;
            return Ok(result);
        }
    };

    match row_ids {
        None => Ok(store.rows()?.into_iter().map(|(_, row)| row).collect()),
        Some(row_ids) => {
            let mut result = Vec::with_capacity(row_ids.len());
            for row_id in row_ids {
                let row = store.row(row_id)?.ok_or_else(|| {
                    IngestError::Store(format!("index points to missing row {}", row_id))
                })?;
                result.push(row);
            }
            Ok(result)
        }
    }
}

/// Write `rows` as TSV with a header line.
pub fn write_tsv<W: Write>(
    writer: W,
    schema: &DerivedColumnSchema,
    rows: &[Vec<Cell>],
) -> Result<(), anyhow::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(writer);
    writer.write_record(schema.names())?;
    for row in rows {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Command line arguments for `query` sub command.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Filter the variant table of a store", long_about = None)]
pub struct Args {
    /// Path to configuration file, defaults to `conf.toml` in the working directory.
    #[arg(long)]
    pub path_conf: Option<String>,
    /// Path to the variant store, defaults to the store in the working directory.
    #[arg(long)]
    pub path_store: Option<String>,
    /// Column to filter on.
    #[arg(long, default_value = "CHROM")]
    pub column: String,
    /// Filter text: a value, comma-separated values, or a dash-separated range.
    #[arg(long, default_value = "")]
    pub filter: String,
    /// Path to output TSV file, defaults to stdout.
    #[arg(long)]
    pub path_output: Option<String>,
}

/// Main entry point for `query` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let settings = Settings::load(args.path_conf.as_deref())?;
    let path_store = match &args.path_store {
        Some(path) => std::path::PathBuf::from(path),
        None => settings.path_store()?,
    };

    tracing::info!("Opening store {:?} ...", &path_store);
    let store = VariantStore::open_read_only(&path_store)
        .map_err(|e| anyhow::anyhow!("could not open store: {}", e))?;
    let schema = store.schema()?;

    let filter = translate(&args.filter, &args.column, &schema)?;
    tracing::info!("{}", filter.describe());
    let rows = select(&store, &filter.predicate)?;
    tracing::info!("... selected {} rows", rows.len().separate_with_commas());

    match &args.path_output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| anyhow::anyhow!("could not create output file {}: {}", path, e))?;
            write_tsv(std::io::BufWriter::new(file), &schema, &rows)?;
        }
        None => write_tsv(std::io::stdout().lock(), &schema, &rows)?,
    }

    tracing::info!(
        "All of `query` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use temp_testdir::TempDir;

    use super::*;
    use crate::{
        conf::StoreCompression,
        ingest::schema::{ColumnSource, ColumnSpec},
    };

    fn schema() -> DerivedColumnSchema {
        let spec = |name: &str, kind, source| ColumnSpec {
            name: name.to_owned(),
            kind,
            source,
        };
        DerivedColumnSchema {
            columns: vec![
                spec("CHROM", ColumnKind::Text, ColumnSource::Fixed(0)),
                spec("POS", ColumnKind::Numeric, ColumnSource::Fixed(1)),
                spec("ID", ColumnKind::Text, ColumnSource::Fixed(2)),
                spec("DP", ColumnKind::Numeric, ColumnSource::Info(String::from("DP"))),
            ],
        }
    }

    #[test]
    fn comma_set_on_text_column() -> Result<(), anyhow::Error> {
        let filter = translate("1,2,3", "CHROM", &schema())?;

        assert_eq!(filter.predicate.clause_count(), 3);
        assert_eq!(
            filter.predicate,
            Predicate::AnyOf {
                column: 0,
                values: vec![
                    Cell::Text(String::from("01")),
                    Cell::Text(String::from("02")),
                    Cell::Text(String::from("03")),
                ]
            }
        );
        assert_eq!(filter.describe(), "Filtering to show CHROM: 01, 02, 03");

        Ok(())
    }

    #[rstest::rstest]
    #[case("5-10", 5.0, 10.0)]
    #[case(" 10 - 5 ", 5.0, 10.0)]
    #[case("5-10-", 5.0, 10.0)]
    fn range_on_numeric_column(
        #[case] text: &str,
        #[case] lo: f64,
        #[case] hi: f64,
    ) -> Result<(), anyhow::Error> {
        let filter = translate(text, "POS", &schema())?;

        assert_eq!(filter.predicate, Predicate::Range { column: 1, lo, hi });
        assert_eq!(filter.describe(), "Filtering to show POS from 5 to 10");
        assert!(filter.predicate.matches(&[Cell::Missing, Cell::Number(5.0)]));
        assert!(filter.predicate.matches(&[Cell::Missing, Cell::Number(10.0)]));
        assert!(!filter.predicate.matches(&[Cell::Missing, Cell::Number(10.5)]));

        Ok(())
    }

    #[test]
    fn equal_bounds_collapse() -> Result<(), anyhow::Error> {
        assert_eq!(
            translate("7-7", "POS", &schema())?.predicate,
            Predicate::Eq {
                column: 1,
                value: Cell::Number(7.0)
            }
        );

        Ok(())
    }

    #[rstest::rstest]
    #[case("5-10", "CHROM", FilterError::NotNumeric { column: String::from("CHROM") })]
    #[case("1-2,3", "POS", FilterError::MixedSeparators)]
    #[case("1-2,3", "CHROM", FilterError::MixedSeparators)]
    #[case("5-", "POS", FilterError::BadRange(String::from("5-")))]
    #[case("1-2-3", "POS", FilterError::BadRange(String::from("1-2-3")))]
    #[case(",", "CHROM", FilterError::NoValues)]
    #[case("abc", "POS", FilterError::NotANumber { column: String::from("POS"), value: String::from("ABC") })]
    fn rejected(#[case] text: &str, #[case] column: &str, #[case] expected: FilterError) {
        assert_eq!(translate(text, column, &schema()), Err(expected));
    }

    #[test]
    fn empty_and_single() -> Result<(), anyhow::Error> {
        let filter = translate("  ", "CHROM", &schema())?;
        assert_eq!(filter.predicate, Predicate::All);
        assert_eq!(filter.describe(), "No Filter Selected");

        let filter = translate("x", "CHROM", &schema())?;
        assert_eq!(
            filter.predicate,
            Predicate::Eq {
                column: 0,
                value: Cell::Text(String::from("X"))
            }
        );
        assert!(matches!(
            translate("1", "NOPE", &schema()),
            Err(FilterError::UnknownColumn { .. })
        ));

        Ok(())
    }

    #[test]
    fn select_with_and_without_index() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let store = VariantStore::create(tmp_dir.join("store"), StoreCompression::Lz4)?;
        let schema = schema();
        store.write_schema(&schema)?;
        let row = |chrom: &str, pos: f64, id: &str, dp: f64| {
            vec![
                Cell::Text(chrom.to_owned()),
                Cell::Number(pos),
                Cell::Text(id.to_owned()),
                Cell::Number(dp),
            ]
        };
        store.append_rows(&[
            row("01", 100.0, "rs1", 10.0),
            row("02", 200.0, "rs2", 20.0),
            row("01", 300.0, "rs3", 30.0),
            row("X", 400.0, "rs4", 40.0),
        ])?;
        store.build_index(&schema)?;

        let positions = |text: &str, column: &str| -> Result<Vec<f64>, anyhow::Error> {
            let filter = translate(text, column, &schema)?;
            Ok(select(&store, &filter.predicate)?
                .iter()
                .filter_map(|row| row[1].as_number())
                .collect())
        };

        assert_eq!(positions("1", "CHROM")?, vec![100.0, 300.0]);
        assert_eq!(positions("1,x", "CHROM")?, vec![100.0, 300.0, 400.0]);
        assert_eq!(positions("400-150", "POS")?, vec![200.0, 300.0, 400.0]);
        assert_eq!(positions("rs2", "ID")?, vec![200.0]);
        // DP has no index
        assert_eq!(positions("15-35", "DP")?, vec![200.0, 300.0]);
        assert_eq!(positions("", "CHROM")?.len(), 4);

        let mut buf = Vec::new();
        write_tsv(&mut buf, &schema, &[vec![
            Cell::Text(String::from("01")),
            Cell::Number(100.0),
            Cell::Missing,
            Cell::Number(0.5),
        ]])?;
        assert_eq!(
            String::from_utf8(buf)?,
            "CHROM\tPOS\tID\tDP\n01\t100\t.\t0.5\n"
        );

        Ok(())
    }
}
