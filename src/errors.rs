use std::path::PathBuf;

use thiserror::Error;

pub type PartResult<T> = Result<T, PartError>;

#[derive(Error, Debug)]
pub enum PartError {
    #[error("directory missing or inaccessible: {0}")]
    BadDirectory(PathBuf),
    #[error("no partition header found in {0}")]
    HeaderNotFound(PathBuf),
    #[error("malformed header field {field}: {value:?}")]
    ParseError { field: String, value: String },
    #[error("inconsistent partition metadata: {0}")]
    Inconsistent(String),
    #[error("no column named {0}")]
    UnknownColumn(String),
    #[error("operation not supported for column {column} of type {ctype}")]
    UnsupportedType { column: String, ctype: &'static str },
    #[error("value array of length {len} matches neither row count {rows} nor mask count {count}")]
    ArraySizeMismatch { len: usize, rows: usize, count: usize },
    #[error("mesh shape {shape} does not multiply out to {rows} rows")]
    BadMeshShape { shape: String, rows: u64 },
    #[error("invalid bounds: {0}")]
    BadBounds(String),
    #[error("file {path} has size {size}, expected {expected}")]
    BadFileSize {
        path: PathBuf,
        size: u64,
        expected: u64,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartError {
    /// Component-scoped negative code matching the scan interface convention.
    /// Zero and positive values are reserved for successful returns.
    pub fn code(&self) -> i32 {
        match self {
            PartError::BadDirectory(_) => -1,
            PartError::HeaderNotFound(_) => -2,
            PartError::ParseError { .. } => -3,
            PartError::Inconsistent(_) => -4,
            PartError::UnknownColumn(_) => -5,
            PartError::UnsupportedType { .. } => -6,
            PartError::ArraySizeMismatch { .. } => -7,
            PartError::BadMeshShape { .. } => -8,
            PartError::BadBounds(_) => -9,
            PartError::BadFileSize { .. } => -10,
            PartError::Io(_) => -11,
        }
    }
}
