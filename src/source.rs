//! Capture backends: where the bytes and metadata of a source tree come
//! from.
//!
//! The capture engine is written against the [`CaptureSource`] trait so
//! that the same contract covers a generic POSIX tree, a Windows tree, or
//! a raw NTFS volume. This module provides the POSIX backend and the
//! symbolic-link reparse codec it relies on; richer backends (short names,
//! security descriptors, named streams) plug in through the same trait.

use std::path::Path;

use rustix::fs::{self, AtFlags, Dir, FileType, Mode, OFlags, CWD};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::lookup::{sha1_file, ResourceLocation, Sha1Digest};
use crate::tree::{
    UnixData, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL, FILE_ATTRIBUTE_REPARSE_POINT,
    IO_REPARSE_TAG_SYMLINK,
};
use crate::util::unix_to_wim_timestamp;

/// Everything the capture engine needs to know about one node.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    /// `FILE_ATTRIBUTE_*` bits.
    pub attributes: u32,
    /// Inode number on the source filesystem.
    pub ino: u64,
    /// Device of the source filesystem (disambiguates inode numbers).
    pub dev: u64,
    /// Creation time in 100-ns ticks since the Windows epoch.
    pub creation_time: u64,
    /// Last-write time in 100-ns ticks since the Windows epoch.
    pub last_write_time: u64,
    /// Last-access time in 100-ns ticks since the Windows epoch.
    pub last_access_time: u64,
    /// Size of the unnamed data stream.
    pub size: u64,
    /// UNIX ownership and mode, where the source has them.
    pub unix_data: Option<UnixData>,
}

impl NodeInfo {
    /// Whether the node is a directory (and not a reparse point).
    pub fn is_directory(&self) -> bool {
        self.attributes & (FILE_ATTRIBUTE_DIRECTORY | FILE_ATTRIBUTE_REPARSE_POINT)
            == FILE_ATTRIBUTE_DIRECTORY
    }

    /// Whether the node is a reparse point.
    pub fn is_reparse(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }
}

/// One `$DATA` stream of a node. The unnamed stream has an empty name.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Stream name; empty for the unnamed stream.
    pub name: String,
    /// Stream size in bytes.
    pub size: u64,
}

/// A hashed stream ready to enter the content store.
#[derive(Debug)]
pub struct CapturedStream {
    /// SHA-1 of the stream content.
    pub hash: Sha1Digest,
    /// Stream size in bytes.
    pub size: u64,
    /// Where the bytes can be re-read from later.
    pub location: ResourceLocation,
}

/// Reparse tag and body read from a reparse point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReparseData {
    /// The reparse tag.
    pub tag: u32,
    /// Tag-specific body, without the 8-byte reparse header.
    pub body: Vec<u8>,
}

/// A tree that can be captured into an image.
pub trait CaptureSource {
    /// Stats a node without following a final symbolic link, unless
    /// `follow` (or the backend's dereference mode) asks otherwise.
    ///
    /// Backends reject nodes that are not regular files, directories or
    /// symbolic links with [`Error::SpecialFile`].
    fn stat(&mut self, path: &Path, follow: bool) -> Result<NodeInfo>;

    /// Entry names of a directory in readdir order, without `.` and `..`.
    fn read_dir(&mut self, path: &Path) -> Result<Vec<String>>;

    /// Reparse tag and body of a reparse-point node.
    fn read_reparse(&mut self, path: &Path) -> Result<ReparseData>;

    /// The `$DATA` streams of a non-directory node.
    fn streams(&mut self, path: &Path) -> Result<Vec<StreamInfo>>;

    /// Hashes one stream of a node; `None` if the stream turned out to be
    /// empty.
    fn capture_stream(&mut self, path: &Path, stream_name: &str)
        -> Result<Option<CapturedStream>>;

    /// The node's 8.3 short name, where the source records one.
    fn short_name(&mut self, path: &Path) -> Result<Option<Box<[u16]>>> {
        let _ = path;
        Ok(None)
    }

    /// The node's security descriptor, where the source records one.
    fn security_descriptor(&mut self, path: &Path) -> Result<Option<Vec<u8>>> {
        let _ = path;
        Ok(None)
    }
}

/// The 8-byte header prefixed to reparse data on the wire.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ReparseHeader {
    /// The reparse tag.
    pub tag: U32,
    /// Length of the body that follows.
    pub data_len: U16,
    /// Always zero.
    pub reserved: U16,
}

/// Header of a symbolic-link reparse body.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct SymlinkReparseHeader {
    substitute_name_offset: U16,
    substitute_name_length: U16,
    print_name_offset: U16,
    print_name_length: U16,
    flags: U32,
}

/// Symbolic-link reparse flag: the target is relative.
pub const SYMLINK_FLAG_RELATIVE: u32 = 0x0000_0001;

/// Encodes a symbolic-link target as a symlink reparse body: substitute
/// and print names both carry the target in UTF-16LE, and relative targets
/// get the `RELATIVE` flag.
pub fn encode_symlink_reparse(target: &str) -> Vec<u8> {
    let wide: Vec<u8> = target
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    let len = wide.len() as u16;
    let flags = if target.starts_with('/') {
        0
    } else {
        SYMLINK_FLAG_RELATIVE
    };
    let header = SymlinkReparseHeader {
        substitute_name_offset: U16::new(0),
        substitute_name_length: U16::new(len),
        print_name_offset: U16::new(len),
        print_name_length: U16::new(len),
        flags: U32::new(flags),
    };
    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(&wide);
    out.extend_from_slice(&wide);
    out
}

/// Decodes the substitute name out of a symlink reparse body.
pub fn decode_symlink_reparse(body: &[u8]) -> Result<String> {
    let (header, names) = SymlinkReparseHeader::read_from_prefix(body)
        .map_err(|_| Error::InvalidDentry("truncated symlink reparse data".into()))?;
    let offset = header.substitute_name_offset.get() as usize;
    let length = header.substitute_name_length.get() as usize;
    let bytes = names
        .get(offset..offset + length)
        .ok_or_else(|| Error::InvalidDentry("symlink reparse name out of range".into()))?;
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidDentry("odd-length symlink reparse name".into()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    crate::util::utf16_to_utf8(&units)
}

/// Captures from a generic POSIX filesystem.
///
/// Short names, security descriptors and named streams do not exist here;
/// symbolic links are translated into symlink reparse points.
#[derive(Debug)]
pub struct PosixSource {
    dereference: bool,
}

impl PosixSource {
    /// Creates a POSIX backend. With `dereference`, symbolic links are
    /// followed instead of being archived.
    pub fn new(dereference: bool) -> Self {
        Self { dereference }
    }

    fn stat_raw(&self, path: &Path, follow: bool) -> Result<rustix::fs::Stat> {
        let flags = if follow || self.dereference {
            AtFlags::empty()
        } else {
            AtFlags::SYMLINK_NOFOLLOW
        };
        fs::statat(CWD, path, flags).map_err(|e| Error::Stat {
            path: path.to_owned(),
            source: e.into(),
        })
    }
}

impl CaptureSource for PosixSource {
    fn stat(&mut self, path: &Path, follow: bool) -> Result<NodeInfo> {
        let st = self.stat_raw(path, follow)?;
        let attributes = match FileType::from_raw_mode(st.st_mode) {
            FileType::RegularFile => FILE_ATTRIBUTE_NORMAL,
            FileType::Directory => FILE_ATTRIBUTE_DIRECTORY,
            FileType::Symlink => {
                // Windows distinguishes file and directory symbolic links
                // by the DIRECTORY attribute on the link itself, keyed to
                // what the target is.
                let mut attributes = FILE_ATTRIBUTE_REPARSE_POINT;
                if let Ok(target) = fs::statat(CWD, path, AtFlags::empty()) {
                    if FileType::from_raw_mode(target.st_mode) == FileType::Directory {
                        attributes |= FILE_ATTRIBUTE_DIRECTORY;
                    }
                }
                attributes
            }
            _ => {
                return Err(Error::SpecialFile {
                    path: path.to_owned(),
                })
            }
        };

        let mtime = unix_to_wim_timestamp(st.st_mtime as i64, st.st_mtime_nsec as i64);
        let atime = unix_to_wim_timestamp(st.st_atime as i64, st.st_atime_nsec as i64);
        Ok(NodeInfo {
            attributes,
            ino: st.st_ino as u64,
            dev: st.st_dev as u64,
            creation_time: mtime,
            last_write_time: mtime,
            last_access_time: atime,
            size: st.st_size as u64,
            unix_data: Some(UnixData {
                uid: st.st_uid,
                gid: st.st_gid,
                mode: st.st_mode as u32,
            }),
        })
    }

    fn read_dir(&mut self, path: &Path) -> Result<Vec<String>> {
        let fd = fs::open(
            path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| Error::Open {
            path: path.to_owned(),
            source: e.into(),
        })?;

        let read_err = |e: rustix::io::Errno| Error::Read {
            path: path.to_owned(),
            source: e.into(),
        };

        let mut names = vec![];
        for item in Dir::read_from(&fd).map_err(read_err)? {
            let entry = item.map_err(read_err)?;
            let bytes = entry.file_name().to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            let name = std::str::from_utf8(bytes)
                .map_err(|_| Error::InvalidUtf8String)?
                .to_owned();
            names.push(name);
        }
        Ok(names)
    }

    fn read_reparse(&mut self, path: &Path) -> Result<ReparseData> {
        let target = fs::readlink(path, Vec::new()).map_err(|e| Error::Readlink {
            path: path.to_owned(),
            source: e.into(),
        })?;
        let target = target.into_string().map_err(|_| Error::InvalidUtf8String)?;
        Ok(ReparseData {
            tag: IO_REPARSE_TAG_SYMLINK,
            body: encode_symlink_reparse(&target),
        })
    }

    fn streams(&mut self, path: &Path) -> Result<Vec<StreamInfo>> {
        let st = self.stat_raw(path, false)?;
        Ok(vec![StreamInfo {
            name: String::new(),
            size: st.st_size as u64,
        }])
    }

    fn capture_stream(
        &mut self,
        path: &Path,
        stream_name: &str,
    ) -> Result<Option<CapturedStream>> {
        debug_assert!(stream_name.is_empty(), "POSIX files have no named streams");
        let (hash, size) = sha1_file(path)?;
        if size == 0 {
            return Ok(None);
        }
        Ok(Some(CapturedStream {
            hash,
            size,
            location: ResourceLocation::OnDisk(path.to_owned()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symlink_reparse_round_trip() {
        for target in ["relative/target", "/absolute/target", "x"] {
            let body = encode_symlink_reparse(target);
            assert_eq!(decode_symlink_reparse(&body).unwrap(), target);
        }
    }

    #[test]
    fn test_symlink_reparse_layout() {
        let body = encode_symlink_reparse("ab");
        // header: offsets 0/4, lengths 4, flags RELATIVE
        assert_eq!(body[..12].to_vec(), vec![0, 0, 4, 0, 4, 0, 4, 0, 1, 0, 0, 0]);
        // both names UTF-16LE "ab"
        assert_eq!(body[12..].to_vec(), vec![b'a', 0, b'b', 0, b'a', 0, b'b', 0]);
    }

    #[test]
    fn test_absolute_target_not_relative() {
        let body = encode_symlink_reparse("/abs");
        let (header, _) = SymlinkReparseHeader::read_from_prefix(&body).unwrap();
        assert_eq!(header.flags.get(), 0);
    }

    #[test]
    fn test_truncated_reparse_rejected() {
        assert!(decode_symlink_reparse(&[0, 1, 2]).is_err());
    }
}
