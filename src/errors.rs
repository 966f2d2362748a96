use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetedBfsError {
    #[error("Invalid argument: {0}")]
    BadArgs(String),

    #[error("Malformed index file {path:?} at line {line}: {reason}")]
    BadIndex {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Malformed mappings file {path:?}: {reason}")]
    BadMappings { path: PathBuf, reason: String },

    #[error("Malformed sequence file {path:?} at line {line}: {reason}")]
    BadSeqs {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Unknown sequence identifier: {0}")]
    UnknownId(String),

    #[error("Sequence {id} is {len} bytes, over the {max} byte fetch buffer cap")]
    SeqTooLarge { id: String, len: u64, max: u64 },

    #[error("K-mer base threshold {0} is below the minimum of 4")]
    KmerThresholdTooLow(u32),

    #[error("mx_threshold_min ({min}) must be smaller than mx_threshold_max ({max})")]
    BadMxThresholds { min: u32, max: u32 },

    #[error("{0} must be positive")]
    NonPositiveRate(&'static str),

    #[error("Filter serialization error: {0}")]
    FilterCodec(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
