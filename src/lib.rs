//! Build Windows Imaging (WIM) archive images from directory trees and
//! apply them onto NTFS volumes.
//!
//! An archive holds one or more images; each image is a full directory
//! tree with alternate data streams, reparse points, short (DOS) names,
//! security descriptors and timestamps. File content is stored once per
//! unique SHA-1 digest and shared across images through the
//! [`lookup::StreamTable`].
//!
//! Capture walks a source tree through a [`source::CaptureSource`] backend
//! and appends a populated image to a [`wim::Wim`]; apply materialises an
//! image onto a volume through the [`ntfs::NtfsVolume`] seam. The on-disk
//! container format, the codecs and the CLI live elsewhere and talk to
//! this crate through those seams.

pub mod apply;
pub mod capture;
pub mod config;
pub mod error;
pub mod lookup;
pub mod ntfs;
pub mod pattern;
pub mod progress;
pub mod security;
pub mod source;
pub mod tree;
pub mod util;
pub mod wim;


pub use error::{Error, Result};

/// Streams are hashed, read and copied in chunks of this size.
pub const WIM_CHUNK_SIZE: usize = 32768;
