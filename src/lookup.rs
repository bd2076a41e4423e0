//! The content-addressed stream table.
//!
//! Every unique stream in an archive is recorded once, keyed by the SHA-1
//! digest of its content, with a reference count tracking how many
//! directory entries and alternate data streams point at it across all
//! images sharing the table. The entry remembers where the bytes currently
//! live: a file on disk, a Win32 handle path, a resource inside the archive
//! container, or an attached in-memory buffer.

use std::collections::{hash_map, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use log::error;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WIM_CHUNK_SIZE;

/// Size of a SHA-1 digest in bytes.
pub const SHA1_HASH_SIZE: usize = 20;

/// A binary SHA-1 digest.
pub type Sha1Digest = [u8; SHA1_HASH_SIZE];

/// Resource header flag: the stream holds image metadata.
pub const RESHDR_FLAG_METADATA: u32 = 0x02;

/// Resource header flag: the stream is stored compressed.
pub const RESHDR_FLAG_COMPRESSED: u32 = 0x04;

/// Location and size of a resource inside the archive container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceEntry {
    /// Byte offset of the resource in the archive.
    pub offset: u64,
    /// Stored (possibly compressed) size.
    pub size: u64,
    /// Decompressed size.
    pub original_size: u64,
    /// `RESHDR_FLAG_*` bits.
    pub flags: u32,
}

/// Where the bytes of a stream can currently be found.
#[derive(Clone, Debug)]
pub enum ResourceLocation {
    /// A file on the local filesystem, read with ordinary I/O.
    OnDisk(PathBuf),
    /// A file reachable through a Win32 handle; the path is kept in UTF-16
    /// so stream suffixes (`:name`) survive.
    Win32Handle(Box<[u16]>),
    /// A resource stored inside the archive itself.
    InWim(ResourceEntry),
    /// Data held in memory.
    AttachedBuffer(Box<[u8]>),
}

/// Access to streams stored inside the archive, provided by the container
/// reader.
pub trait WimResourceReader {
    /// Opens the decompressed byte stream for the given resource.
    fn open_resource(&mut self, entry: &ResourceEntry) -> std::io::Result<Box<dyn Read + '_>>;
}

/// One entry of the stream table.
#[derive(Debug)]
pub struct StreamEntry {
    /// SHA-1 digest of the stream content.
    pub hash: Sha1Digest,
    /// Number of (dentry, stream slot) references to this entry across all
    /// images sharing the table.
    pub refcount: u32,
    /// Where the bytes live.
    pub location: ResourceLocation,
    /// Decompressed size of the stream.
    pub original_size: u64,
    /// Stored size (equals `original_size` until the writer compresses).
    pub stored_size: u64,
    /// `RESHDR_FLAG_*` bits.
    pub flags: u32,
}

impl StreamEntry {
    /// Whether this entry holds image metadata rather than file content.
    pub fn is_metadata(&self) -> bool {
        self.flags & RESHDR_FLAG_METADATA != 0
    }

    fn open<'a, 'r>(
        &'a self,
        resources: Option<&'r mut dyn WimResourceReader>,
    ) -> Result<Box<dyn Read + 'a>>
    where
        'r: 'a,
    {
        match &self.location {
            ResourceLocation::OnDisk(path) => {
                let file = File::open(path).map_err(|source| Error::Open {
                    path: path.clone(),
                    source,
                })?;
                Ok(Box::new(file))
            }
            ResourceLocation::AttachedBuffer(buf) => Ok(Box::new(&buf[..])),
            ResourceLocation::InWim(entry) => {
                let reader = resources.ok_or(Error::Unsupported(
                    "no resource reader is attached to this archive",
                ))?;
                reader
                    .open_resource(entry)
                    .map_err(|source| Error::Read {
                        path: PathBuf::from("(archive resource)"),
                        source,
                    })
            }
            ResourceLocation::Win32Handle(_) => Err(Error::Unsupported(
                "Win32 handle resources cannot be read on this platform",
            )),
        }
    }

    /// Streams the content to `sink` in chunks of at most [`WIM_CHUNK_SIZE`]
    /// bytes, recomputing the SHA-1 along the way. At EOF the digest is
    /// checked against [`StreamEntry::hash`].
    ///
    /// `sink` receives the byte offset of each chunk.
    pub fn extract<F>(
        &self,
        resources: Option<&mut dyn WimResourceReader>,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(u64, &[u8]) -> Result<()>,
    {
        let mut reader = self.open(resources)?;
        let mut ctx = Sha1::new();
        let mut remaining = self.original_size;
        let mut offset = 0u64;
        let mut buf = [0u8; WIM_CHUNK_SIZE];

        while remaining > 0 {
            let want = remaining.min(WIM_CHUNK_SIZE as u64) as usize;
            reader
                .read_exact(&mut buf[..want])
                .map_err(|source| Error::Read {
                    path: PathBuf::from(hex::encode(self.hash)),
                    source,
                })?;
            ctx.update(&buf[..want]);
            sink(offset, &buf[..want])?;
            offset += want as u64;
            remaining -= want as u64;
        }

        let hash: Sha1Digest = ctx.finalize().into();
        if hash != self.hash {
            error!(
                "invalid checksum on stream {} (recomputed {})",
                hex::encode(self.hash),
                hex::encode(hash)
            );
            return Err(Error::InvalidResourceHash);
        }
        Ok(())
    }

    /// Reads the whole stream into memory, verifying its digest.
    pub fn read_all(&self, resources: Option<&mut dyn WimResourceReader>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.original_size as usize);
        self.extract(resources, |_, chunk| {
            out.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(out)
    }
}

/// The SHA-1-indexed table of unique streams.
#[derive(Debug, Default)]
pub struct StreamTable {
    entries: HashMap<Sha1Digest, StreamEntry>,
}

impl StreamTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unique streams in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a stream by digest.
    pub fn lookup(&self, hash: &Sha1Digest) -> Option<&StreamEntry> {
        self.entries.get(hash)
    }

    /// Looks up a stream by digest, mutably.
    pub fn lookup_mut(&mut self, hash: &Sha1Digest) -> Option<&mut StreamEntry> {
        self.entries.get_mut(hash)
    }

    /// Inserts an entry assumed to be new.
    pub fn insert(&mut self, entry: StreamEntry) {
        let prev = self.entries.insert(entry.hash, entry);
        debug_assert!(prev.is_none(), "stream inserted twice");
    }

    /// References the stream with the given digest: if present, its
    /// refcount is incremented; otherwise `init` supplies the location and
    /// decompressed size of a fresh entry with refcount 1.
    pub fn add_or_ref(
        &mut self,
        hash: Sha1Digest,
        init: impl FnOnce() -> (ResourceLocation, u64),
    ) {
        match self.entries.entry(hash) {
            hash_map::Entry::Occupied(e) => e.into_mut().refcount += 1,
            hash_map::Entry::Vacant(v) => {
                let (location, size) = init();
                v.insert(StreamEntry {
                    hash,
                    refcount: 1,
                    location,
                    original_size: size,
                    stored_size: size,
                    flags: 0,
                });
            }
        }
    }

    /// Drops one reference to the stream; the entry is removed when its
    /// refcount reaches zero.
    pub fn unref(&mut self, hash: &Sha1Digest) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                self.entries.remove(hash);
            }
        } else {
            debug_assert!(false, "unref of a stream not in the table");
        }
    }

    /// Iterates over every entry, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &StreamEntry> {
        self.entries.values()
    }
}

/// Computes the SHA-1 of a file by streaming it in [`WIM_CHUNK_SIZE`]
/// pieces, returning the digest and the byte count.
pub fn sha1_file(path: &std::path::Path) -> Result<(Sha1Digest, u64)> {
    let mut file = File::open(path).map_err(|source| Error::Open {
        path: path.to_owned(),
        source,
    })?;
    let mut ctx = Sha1::new();
    let mut buf = [0u8; WIM_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|source| Error::Read {
            path: path.to_owned(),
            source,
        })?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
        total += n as u64;
    }
    Ok((ctx.finalize().into(), total))
}

/// Computes the SHA-1 of an in-memory buffer.
pub fn sha1_buf(data: &[u8]) -> Sha1Digest {
    Sha1::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached(data: &[u8]) -> (Sha1Digest, ResourceLocation, u64) {
        (
            sha1_buf(data),
            ResourceLocation::AttachedBuffer(data.into()),
            data.len() as u64,
        )
    }

    #[test]
    fn test_add_or_ref_counts() {
        let mut table = StreamTable::new();
        let (hash, location, size) = attached(b"hello\n");
        table.add_or_ref(hash, || (location, size));
        table.add_or_ref(hash, || unreachable!("entry already present"));
        assert_eq!(table.lookup(&hash).unwrap().refcount, 2);
        assert_eq!(table.len(), 1);

        table.unref(&hash);
        assert_eq!(table.lookup(&hash).unwrap().refcount, 1);
        table.unref(&hash);
        assert!(table.lookup(&hash).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_known_digest() {
        // sha1("hello\n")
        let (hash, _, _) = attached(b"hello\n");
        assert_eq!(
            hex::encode(hash),
            "f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }

    #[test]
    fn test_extract_verifies_digest() {
        let mut table = StreamTable::new();
        let (hash, location, size) = attached(b"ABCDEFGH");
        table.add_or_ref(hash, || (location, size));

        let mut out = vec![];
        table
            .lookup(&hash)
            .unwrap()
            .extract(None, |offset, chunk| {
                assert_eq!(offset as usize, out.len());
                out.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(out, b"ABCDEFGH");
    }

    #[test]
    fn test_extract_detects_corruption() {
        let entry = StreamEntry {
            hash: [0; SHA1_HASH_SIZE],
            refcount: 1,
            location: ResourceLocation::AttachedBuffer(Box::from(*b"tampered")),
            original_size: 8,
            stored_size: 8,
            flags: 0,
        };
        assert!(matches!(
            entry.extract(None, |_, _| Ok(())),
            Err(Error::InvalidResourceHash)
        ));
    }

    #[test]
    fn test_win32_location_unreadable_here() {
        let entry = StreamEntry {
            hash: sha1_buf(b"x"),
            refcount: 1,
            location: ResourceLocation::Win32Handle(vec![b'x' as u16].into_boxed_slice()),
            original_size: 1,
            stored_size: 1,
            flags: 0,
        };
        assert!(matches!(
            entry.read_all(None),
            Err(Error::Unsupported(_))
        ));
    }
}
