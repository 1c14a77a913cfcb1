//! Error taxonomy of the ingestion pipeline.

use std::path::PathBuf;

/// Reason why the head of a file was rejected by the format validator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatProblem {
    #[error("VCF doesn't contain all required columns, missing {missing:?}, contains {found:?}")]
    MissingColumns {
        missing: Vec<String>,
        found: Vec<String>,
    },
    #[error("no #CHROM column header found in the first {lines} lines")]
    MissingHeader { lines: usize },
    #[error("data line {line_no} appears before the #CHROM column header")]
    DataBeforeHeader { line_no: usize },
    #[error("line {line_no} has {found} columns but column {column:?} needs at least {needed}")]
    TooFewColumns {
        line_no: usize,
        column: String,
        needed: usize,
        found: usize,
    },
    #[error("column 'POS' doesn't only contain digits: {value:?}")]
    InvalidPos { value: String },
    #[error("column 'REF' doesn't only contain A,C,G,T,N: {value:?}")]
    InvalidRef { value: String },
    #[error("column 'ALT' doesn't only contain A,C,G,T,N or <ID>: {value:?}")]
    InvalidAlt { value: String },
    #[error("column 'QUAL' is neither a number nor '.': {value:?}")]
    InvalidQual { value: String },
    #[error("VCF is empty, there are no variants at all in this VCF")]
    Empty,
    #[error("VCF contains too few variants to analyse ({count})")]
    TooFewVariants { count: usize },
}

/// Errors that abort the current ingestion attempt.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("problem accessing file {path:?}: {reason}")]
    FileAccess { path: PathBuf, reason: String },
    #[error("problem decompressing file {path:?}: {reason}")]
    Decompression { path: PathBuf, reason: String },
    #[error("selected file must be a VCF file: {path:?}")]
    UnknownFormat { path: PathBuf },
    #[error("VCF not valid: {0}")]
    FormatInvalid(#[from] FormatProblem),
    #[error("problem parsing VCF record {line_no}: {reason}")]
    Parse { line_no: usize, reason: String },
    #[error("problem with variant store: {0}")]
    Store(String),
}

impl IngestError {
    /// Shortcut for building a `FileAccess` error from an IO error.
    pub fn file_access<P: Into<PathBuf>>(path: P, err: std::io::Error) -> Self {
        IngestError::FileAccess {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Shortcut for building a `Decompression` error from an IO error.
    pub fn decompression<P: Into<PathBuf>>(path: P, err: std::io::Error) -> Self {
        IngestError::Decompression {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

impl From<rocksdb::Error> for IngestError {
    fn from(e: rocksdb::Error) -> Self {
        IngestError::Store(e.to_string())
    }
}
