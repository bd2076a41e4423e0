//! Progress reporting for capture.
//!
//! Events are delivered synchronously to a caller-supplied callback on the
//! calling thread; there is no background reporting.

use std::path::Path;

/// An event describing capture progress.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// Scanning of one capture source is starting.
    ScanBegin {
        /// Filesystem path of the source.
        source: &'a Path,
        /// Target path inside the image.
        target: &'a str,
    },
    /// A path was visited during the scan (emitted in verbose mode).
    ScanDentry {
        /// The path that was visited.
        path: &'a Path,
        /// Whether the configuration excluded it.
        excluded: bool,
    },
    /// Scanning of one capture source finished.
    ScanEnd {
        /// Filesystem path of the source.
        source: &'a Path,
        /// Target path inside the image.
        target: &'a str,
    },
}
