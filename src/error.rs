use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} ends in the middle of a record")]
    Truncated { path: PathBuf },
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    #[error("record payload ended after {read} of its fields")]
    ShortPayload { read: usize },
    #[error("unknown access type {0}")]
    UnknownAccessType(u64),
    #[error("record stream has no input files")]
    NoFiles,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("override `{0}` is not of the form STRUCTURE/parameter=value")]
    OverrideSyntax(String),
    #[error("override targets unknown structure `{0}`")]
    UnknownStructure(String),
    #[error("override targets unknown parameter `{structure}/{parameter}`")]
    UnknownParameter { structure: String, parameter: String },
    #[error("no level 1 data cache configured")]
    MissingL1Data,
    #[error("cache line sizes differ between levels ({first} and {second} bytes)")]
    InconsistentLineSize { first: u64, second: u64 },
    #[error("`{0}` must be non-zero")]
    Zero(&'static str),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("metadata key `{0}` is missing")]
    MissingKey(&'static str),
    #[error("metadata value `{key}` is not a number: `{value}`")]
    NotANumber { key: &'static str, value: String },
    #[error("metadata line `{0}` is not a `key value` pair")]
    BadLine(String),
    #[error("window marker out of order at line {0}")]
    WindowMarker(usize),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{remaining} memory operations left unmatched for bursts {bursts:?}")]
    Correlation { remaining: i64, bursts: Vec<usize> },
    #[error("cached histogram for burst {found} where burst {expected} was expected")]
    CacheMismatch { expected: usize, found: usize },
    #[error("cached histogram file {0} ended early")]
    CacheExhausted(PathBuf),
    #[error("burst {burst} out of range ({len} bursts)")]
    BurstOutOfRange { burst: usize, len: usize },
    #[error("no input for {0}")]
    MissingInput(String),
    #[error("serialising results: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ModelError::Io {
            path: path.into(),
            source,
        }
    }
}
