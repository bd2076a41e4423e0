//! Error types for the library.
//!
//! Every fallible operation returns [`Result<T>`], an alias for
//! `Result<T, Error>`. The first error encountered propagates to the caller;
//! cleanup failures discovered while unwinding are logged but never replace
//! the original error (with the one documented exception on the apply path,
//! where a failure to close an inode promotes an otherwise successful
//! result to [`Error::Ntfs3g`]).

use std::{io, path::PathBuf};

use thiserror::Error;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The failure kinds surfaced to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// A memory allocation failed.
    #[error("out of memory")]
    Nomem,

    /// A file or directory could not be read.
    #[error("failed to read {path:?}: {source}")]
    Read {
        /// Path of the object being read.
        path: PathBuf,
        /// The underlying platform error.
        source: io::Error,
    },

    /// A file or directory could not be opened.
    #[error("failed to open {path:?}: {source}")]
    Open {
        /// Path of the object being opened.
        path: PathBuf,
        /// The underlying platform error.
        source: io::Error,
    },

    /// A file or directory could not be stat'ed.
    #[error("failed to stat {path:?}: {source}")]
    Stat {
        /// Path of the object being stat'ed.
        path: PathBuf,
        /// The underlying platform error.
        source: io::Error,
    },

    /// The target of a symbolic link could not be read.
    #[error("failed to read target of symbolic link {path:?}: {source}")]
    Readlink {
        /// Path of the symbolic link.
        path: PathBuf,
        /// The underlying platform error.
        source: io::Error,
    },

    /// The capture engine encountered a file that is neither a regular
    /// file, a directory, nor a symbolic link.
    #[error("{path:?} is not a regular file, directory, or symbolic link")]
    SpecialFile {
        /// Path of the offending object.
        path: PathBuf,
    },

    /// A name or path could not be represented as UTF-8.
    #[error("string could not be represented as UTF-8")]
    InvalidUtf8String,

    /// Character-set conversion is not available on this host.
    #[error("character-set conversion is not available")]
    IconvNotAvailable,

    /// The capture configuration text is malformed, or it excludes the
    /// root of the tree being captured.
    #[error("invalid capture configuration: {0}")]
    InvalidCaptureConfig(String),

    /// An argument to a public operation is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// An image with the requested name already exists in the archive.
    #[error("there is already an image named {0:?}")]
    ImageNameCollision(String),

    /// The operation is not possible on a split (multi-part) archive.
    #[error("operation not supported on split archives")]
    SplitUnsupported,

    /// A capture source could not be overlaid onto the image tree.
    #[error("invalid overlay: {0}")]
    InvalidOverlay(String),

    /// A directory entry in the image is inconsistent.
    #[error("invalid directory entry: {0}")]
    InvalidDentry(String),

    /// A stream's content did not match its recorded SHA-1 digest.
    #[error("stream content does not match its recorded SHA-1 digest")]
    InvalidResourceHash,

    /// An operation on the NTFS volume failed. The detail is logged at the
    /// call site that detected the failure.
    #[error("NTFS volume operation failed")]
    Ntfs3g,

    /// The requested operation is not supported in this configuration.
    #[error("{0}")]
    Unsupported(&'static str),

    /// Writing extracted data failed.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Destination being written (an image path or stream name).
        path: String,
        /// The underlying platform error.
        source: io::Error,
    },
}
