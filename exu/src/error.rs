use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why the bytes of a file could not be transferred.
#[derive(Error, Debug)]
pub enum StreamFailure {
    #[error(transparent)]
    Volume(#[from] exfat::Error),

    #[error("stream delivered {written} bytes, expected {expected}")]
    ShortStream { expected: u64, written: u64 },
}

/// Failure of an extraction run. Every variant names the path it failed on.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("cannot resolve path {}", path.display())]
    PathResolution {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot create directory {}", path.display())]
    DirectoryCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write {}", path.display())]
    Sink {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot extract {}", path.display())]
    Stream { path: PathBuf, source: StreamFailure },
}

impl ExtractionError {
    pub fn path(&self) -> &Path {
        match self {
            ExtractionError::PathResolution { path, .. }
            | ExtractionError::DirectoryCreation { path, .. }
            | ExtractionError::Sink { path, .. }
            | ExtractionError::Stream { path, .. } => path,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open filesystem image {}", path.display())]
    OpenError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot read exFAT volume")]
    ExfatError(#[from] exfat::Error),

    #[error(transparent)]
    ExtractionError(#[from] ExtractionError),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("cannot serialize listing")]
    JsonError(#[from] serde_json::Error),

    #[error("CLI input error: {0}")]
    CliInputError(String),
}
