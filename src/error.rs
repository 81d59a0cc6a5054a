//! Error kinds and their reporting policy (see spec.md "ERROR HANDLING DESIGN").
//!
//! Policy (fatal / non-fatal / local-skip) is decided by the call site, not
//! by this enum -- mirroring how `ncd::NcdError` stays a plain data carrier
//! and `run()` alone decides what to print and which exit code to use.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error writing `{path}`: {source}")]
    OutputIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("`{path}` does not seem to be a locate database: {reason}")]
    BadFormat { path: PathBuf, reason: String },

    #[error("race detected: `{path}` changed while descending into it")]
    RaceDetected { path: PathBuf },

    #[error("name or path at `{path}` exceeds the maximum supported length")]
    PathTooLarge { path: PathBuf },

    #[error("`{path}` is locked (probably by an earlier updatedb)")]
    LockHeld { path: PathBuf },

    #[error("invalid pattern `{pattern}`: {source}")]
    PatternCompile {
        pattern: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("argument error: {0}")]
    Arg(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
