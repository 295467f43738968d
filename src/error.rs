//! Error types for RangeSync

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for RangeSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RangeSync
#[derive(Error, Debug)]
pub enum Error {
    /// Control file could not be parsed or carries an unsupported header
    #[error("malformed control file: {message}")]
    ControlFileMalformed { message: String },

    /// Checksum table shorter than the header promised
    #[error("checksum table truncated: expected {expected} bytes, got {got}")]
    BlockMetaTruncated { expected: u64, got: u64 },

    /// I/O error on the scratch file
    #[error("scratch file error: {message}")]
    ScratchIo {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error reading a seed file; the session continues without it
    #[error("seed error at {path}: {source}")]
    SeedIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP collaborator failed (connect, TLS, body stream)
    #[error("fetch error from {url}: {message}")]
    RemoteFetch {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Non-2xx status from a mirror
    #[error("HTTP {code} from {url}: {message}")]
    HttpStatus {
        url: String,
        code: u16,
        message: String,
    },

    /// 3xx response without a Location header
    #[error("redirect from {url} has no Location header")]
    NoLocationHeader { url: String },

    /// Remotely fetched blocks failed strong-checksum verification
    #[error("corrupt data received for blocks {lo}..={hi}")]
    CorruptRemoteBlock { lo: u32, hi: u32 },

    /// Every mirror failed before the file was complete
    #[error("all download URLs failed before completion")]
    AllUrlsExhausted,

    /// Assembled file does not match the whole-file SHA-1
    #[error("assembled file failed SHA-1 verification (partial file kept at {part})")]
    FinalChecksumMismatch { part: PathBuf },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// I/O errors outside the scratch/seed paths (backup, rename, mtime)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a control-file error
    pub fn control(message: impl Into<String>) -> Self {
        Self::ControlFileMalformed {
            message: message.into(),
        }
    }

    /// Create a scratch-file error with context
    pub fn scratch(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::ScratchIo {
            message: message.into(),
            source,
        }
    }

    /// Create a seed error for the given path
    pub fn seed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::SeedIo {
            path: path.into(),
            source,
        }
    }

    /// Create a fetch error with context
    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteFetch {
            url: url.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Whether this error ends the session.
    ///
    /// Seed and mirror failures are recovered locally (skip the seed,
    /// blacklist the mirror); everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::SeedIo { .. }
                | Error::RemoteFetch { .. }
                | Error::HttpStatus { .. }
                | Error::NoLocationHeader { .. }
                | Error::CorruptRemoteBlock { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}
