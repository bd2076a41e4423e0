//! The seam between the apply engine and an NTFS implementation.
//!
//! The trait mirrors the operation set of an NTFS library (create, link,
//! attribute open/pwrite, reparse data, DOS names, security, timestamps)
//! with explicit handle lifetimes: NTFS userspace drivers require inodes
//! to be closed exactly once and in the right order, so handles are
//! first-class values here rather than RAII guards.
//!
//! Trait methods return `io::Result`; the apply engine logs the platform
//! detail and surfaces [`Error::Ntfs3g`](crate::error::Error::Ntfs3g).

use std::io;

/// What `create` should make.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateKind {
    /// A regular file. Reparse points are created as regular files and
    /// receive their reparse data afterwards.
    Regular,
    /// A directory.
    Directory,
}

/// Security-information selection bit: the owner SID.
pub const OWNER_SECURITY_INFORMATION: u32 = 0x1;
/// Security-information selection bit: the group SID.
pub const GROUP_SECURITY_INFORMATION: u32 = 0x2;
/// Security-information selection bit: the DACL.
pub const DACL_SECURITY_INFORMATION: u32 = 0x4;
/// Security-information selection bit: the SACL.
pub const SACL_SECURITY_INFORMATION: u32 = 0x8;

/// The selection used when applying captured descriptors.
pub const ALL_SECURITY_INFORMATION: u32 = OWNER_SECURITY_INFORMATION
    | GROUP_SECURITY_INFORMATION
    | DACL_SECURITY_INFORMATION
    | SACL_SECURITY_INFORMATION;

/// A mounted NTFS volume an image can be applied onto.
pub trait NtfsVolume {
    /// An open inode handle.
    type Inode;
    /// An open attribute (data stream) handle.
    type Attr;

    /// Resolves an absolute image path to an open inode.
    fn inode_by_path(&mut self, path: &str) -> io::Result<Self::Inode>;

    /// Creates a file or directory named `name` under `dir`.
    fn create(
        &mut self,
        dir: &mut Self::Inode,
        name: &str,
        kind: CreateKind,
    ) -> io::Result<Self::Inode>;

    /// Adds a hard link to `target` under `dir` with `name`.
    fn link(&mut self, target: &mut Self::Inode, dir: &mut Self::Inode, name: &str)
        -> io::Result<()>;

    /// Opens the named `$DATA` stream of `inode`, creating it if absent.
    /// The empty name is the unnamed stream.
    fn attr_open(&mut self, inode: &mut Self::Inode, stream_name: &str)
        -> io::Result<Self::Attr>;

    /// Writes `data` at `offset` in the open attribute, returning the
    /// number of bytes written.
    fn attr_pwrite(&mut self, attr: &mut Self::Attr, offset: u64, data: &[u8])
        -> io::Result<usize>;

    /// Closes an attribute handle.
    fn attr_close(&mut self, attr: Self::Attr);

    /// Sets the `FILE_ATTRIBUTE_*` bits of an inode.
    fn set_attributes(&mut self, inode: &mut Self::Inode, attributes: u32) -> io::Result<()>;

    /// Applies the selected parts of a security descriptor.
    fn set_security(
        &mut self,
        inode: &mut Self::Inode,
        selection: u32,
        descriptor: &[u8],
    ) -> io::Result<()>;

    /// Sets reparse data from a full reparse buffer (header plus body).
    fn set_reparse_data(&mut self, inode: &mut Self::Inode, data: &[u8]) -> io::Result<()>;

    /// Binds a DOS (8.3) name to the inode. Consumes and closes **both**
    /// handles, matching the NTFS library call it wraps.
    fn set_dos_name(
        &mut self,
        inode: Self::Inode,
        dir: Self::Inode,
        short_name: &str,
    ) -> io::Result<()>;

    /// Sets the `(creation, last write, last access)` triple, in 100-ns
    /// ticks since the Windows epoch.
    fn set_times(&mut self, inode: &mut Self::Inode, times: [u64; 3]) -> io::Result<()>;

    /// Closes an inode handle.
    fn close(&mut self, inode: Self::Inode) -> io::Result<()>;
}
