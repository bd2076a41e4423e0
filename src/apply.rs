//! Applying an image onto an NTFS volume.
//!
//! The volume is expected to carry an empty filesystem; the image carries a
//! full one. Two depth-first passes drive the work: the first creates
//! objects and writes streams (pre-order, so parents exist before their
//! children), the second sets timestamps (post-order, so opening a child
//! cannot disturb timestamps already set on its parent).
//!
//! Every NTFS inode handle is closed on every exit path. A close failure
//! is logged; it never replaces an earlier error, but it does demote an
//! otherwise successful result to [`Error::Ntfs3g`].

use std::collections::HashMap;

use log::{debug, error, info};
use zerocopy::little_endian::{U16, U32};
use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::lookup::{Sha1Digest, StreamTable, WimResourceReader};
use crate::ntfs::{CreateKind, NtfsVolume, ALL_SECURITY_INFORMATION};
use crate::security::SdSet;
use crate::source::ReparseHeader;
use crate::tree::{DentryId, ImageTree, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_REPARSE_POINT};
use crate::util::utf16_to_utf8;
use crate::wim::{Wim, ALL_IMAGES};

/// Flags accepted by the extraction operations.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct ExtractFlags(u32);

impl ExtractFlags {
    /// Extract files as symbolic links to the content store (not possible
    /// on an NTFS volume).
    pub const SYMLINK: Self = Self(0x1);
    /// Extract duplicate files as hard links (not possible on an NTFS
    /// volume, which reproduces the image's own hard links instead).
    pub const HARDLINK: Self = Self(0x2);
    /// Report each applied path.
    pub const VERBOSE: Self = Self(0x4);

    /// No flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ExtractFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

struct Applier<'a, 'r, V: NtfsVolume> {
    vol: &'a mut V,
    tree: &'a ImageTree,
    table: &'a StreamTable,
    security: &'a SdSet,
    resources: Option<&'a mut (dyn WimResourceReader + 'r)>,
    // dentry -> path it was extracted at; also marks pre-applied dentries
    extracted: HashMap<DentryId, String>,
    verbose: bool,
}

impl<V: NtfsVolume> Applier<'_, '_, V> {
    fn try_open(&mut self, path: &str) -> Result<V::Inode> {
        self.vol.inode_by_path(path).map_err(|e| {
            error!("could not find NTFS inode for {path}: {e}");
            Error::Ntfs3g
        })
    }

    fn close_quiet(&mut self, inode: V::Inode, what: &str) -> bool {
        match self.vol.close(inode) {
            Ok(()) => true,
            Err(e) => {
                error!("failed to close {what}: {e}");
                false
            }
        }
    }

    /// Closes up to two handles, demoting a success to `Ntfs3g` if a close
    /// fails, without replacing an earlier error.
    fn finish(
        &mut self,
        mut ret: Result<()>,
        ni: Option<V::Inode>,
        dir_ni: Option<V::Inode>,
    ) -> Result<()> {
        if let Some(dir_ni) = dir_ni {
            if !self.close_quiet(dir_ni, "directory inode") && ret.is_ok() {
                ret = Err(Error::Ntfs3g);
            }
        }
        if let Some(ni) = ni {
            if !self.close_quiet(ni, "inode") && ret.is_ok() {
                ret = Err(Error::Ntfs3g);
            }
        }
        ret
    }

    fn parent_path(&self, did: DentryId) -> String {
        let parent = self.tree[did].parent.expect("non-root dentry has a parent");
        self.tree[parent].full_path.clone()
    }

    fn apply_dentry(&mut self, did: DentryId) -> Result<()> {
        if self.extracted.contains_key(&did) {
            // already created while pre-applying a DOS name
            return Ok(());
        }
        let tree = self.tree;
        debug!("applying dentry {} to NTFS", tree[did].full_path);
        if self.verbose {
            info!("{}", tree[did].full_path);
        }
        if tree[did].is_root() {
            return self.apply_root(did);
        }
        let parent_path = self.parent_path(did);
        let dir_ni = self.try_open(&parent_path)?;
        self.apply_dentry_at(did, dir_ni)
    }

    /// The root has no creation step; only attributes and security apply
    /// to the volume's existing `/`.
    fn apply_root(&mut self, did: DentryId) -> Result<()> {
        let mut ni = self.try_open("/")?;
        let ret = self.apply_metadata(did, &mut ni);
        self.finish(ret, Some(ni), None)
    }

    /// If `did` belongs to a hard-link group with a DOS-named sibling in
    /// the same directory that has not been extracted yet, extract that
    /// sibling first so the short name binds to a Win32-namespace long
    /// name rather than a POSIX-namespace alias created by a later link.
    ///
    /// Consumes `dir_ni` if pre-application happens and returns a freshly
    /// resolved parent handle.
    fn preapply_dos_sibling(&mut self, did: DentryId, dir_ni: V::Inode) -> Result<V::Inode> {
        let tree = self.tree;
        let inode = tree.inode_of(did);
        if inode.links.len() < 2 {
            return Ok(dir_ni);
        }

        let parent = tree[did].parent;
        let mut with_dos_name = None;
        for &other in &inode.links {
            if other == did {
                continue;
            }
            if tree[other].parent == parent && tree[other].short_name.is_some() {
                if with_dos_name.is_some() {
                    error!(
                        "found multiple DOS names for file {} in the same directory",
                        tree[other].full_path
                    );
                    self.close_quiet(dir_ni, "directory inode");
                    return Err(Error::InvalidDentry(
                        "multiple DOS names in one hard-link group and directory".into(),
                    ));
                }
                with_dos_name = Some(other);
            }
        }

        let Some(target) = with_dos_name else {
            return Ok(dir_ni);
        };
        if self.extracted.contains_key(&target) {
            return Ok(dir_ni);
        }

        debug!("pre-applying DOS name {}", tree[target].full_path);
        self.apply_dentry_at(target, dir_ni)?;
        let parent_path = self.parent_path(did);
        self.try_open(&parent_path)
    }

    fn apply_dentry_at(&mut self, did: DentryId, mut dir_ni: V::Inode) -> Result<()> {
        let tree = self.tree;
        let is_directory = tree.inode_of(did).attributes & FILE_ATTRIBUTE_DIRECTORY != 0;

        if !is_directory {
            dir_ni = self.preapply_dos_sibling(did, dir_ni)?;

            // an already-extracted group member means a hard link instead
            // of writing the data again
            let link_target = tree.inode_of(did)
                .links
                .iter()
                .filter(|&&other| other != did)
                .find_map(|other| self.extracted.get(other).cloned());
            if let Some(extracted_path) = link_target {
                debug!(
                    "extracting NTFS hard link {} => {extracted_path}",
                    tree[did].full_path
                );
                let mut to_ni = match self.try_open(&extracted_path) {
                    Ok(ni) => ni,
                    Err(e) => return self.finish(Err(e), None, Some(dir_ni)),
                };
                let name = tree[did].name.clone();
                if let Err(e) = self.vol.link(&mut to_ni, &mut dir_ni, &name) {
                    error!(
                        "could not create hard link {} => {extracted_path}: {e}",
                        tree[did].full_path
                    );
                    return self.finish(Err(Error::Ntfs3g), Some(to_ni), Some(dir_ni));
                }
                self.extracted.insert(did, tree[did].full_path.clone());
                return self.set_dos_name_and_close(did, to_ni, dir_ni, true);
            }

            self.extracted.insert(did, tree[did].full_path.clone());
        }

        // Reparse points are created as regular files; the reparse data is
        // set afterwards.
        let kind = if is_directory {
            CreateKind::Directory
        } else {
            CreateKind::Regular
        };
        let name = tree[did].name.clone();
        let mut ni = match self.vol.create(&mut dir_ni, &name, kind) {
            Ok(ni) => ni,
            Err(e) => {
                error!(
                    "could not create NTFS object for {}: {e}",
                    tree[did].full_path
                );
                return self.finish(Err(Error::Ntfs3g), None, Some(dir_ni));
            }
        };

        let is_reparse = tree.inode_of(did).attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0;
        if !is_directory && !is_reparse {
            if let Err(e) = self.write_streams(did, &mut ni) {
                return self.finish(Err(e), Some(ni), Some(dir_ni));
            }
        }

        if let Err(e) = self.apply_metadata(did, &mut ni) {
            return self.finish(Err(e), Some(ni), Some(dir_ni));
        }

        if is_reparse {
            if let Err(e) = self.apply_reparse(did, &mut ni) {
                return self.finish(Err(e), Some(ni), Some(dir_ni));
            }
        }

        self.set_dos_name_and_close(did, ni, dir_ni, false)
    }

    /// Writes the unnamed stream and every alternate data stream. Opening
    /// an attribute creates it, so empty streams still come into being.
    fn write_streams(&mut self, did: DentryId, ni: &mut V::Inode) -> Result<()> {
        let tree = self.tree;
        let table = self.table;
        let inode = tree.inode_of(did);
        let full_path = &tree[did].full_path;
        debug!(
            "writing {} NTFS data stream(s) for {full_path}",
            inode.ads.len() + 1
        );

        let mut jobs: Vec<(&str, Option<&Sha1Digest>)> =
            vec![("", inode.unnamed_stream.as_ref())];
        for ads in &inode.ads {
            jobs.push((ads.name.as_str(), ads.stream.as_ref()));
        }

        for (stream_name, hash) in jobs {
            let mut attr = match self.vol.attr_open(ni, stream_name) {
                Ok(attr) => attr,
                Err(e) => {
                    error!("failed to open a data stream of extracted file {full_path}: {e}");
                    return Err(Error::Ntfs3g);
                }
            };
            let result = match hash {
                None => Ok(()),
                Some(hash) => match table.lookup(hash) {
                    None => Err(Error::InvalidDentry(format!(
                        "stream {} of {full_path} is missing from the lookup table",
                        hex::encode(hash)
                    ))),
                    Some(entry) => {
                        let vol = &mut *self.vol;
                        let resources = self.resources.as_deref_mut();
                        entry.extract(resources, |offset, chunk| {
                            let written = vol
                                .attr_pwrite(&mut attr, offset, chunk)
                                .map_err(|source| Error::Write {
                                    path: full_path.clone(),
                                    source,
                                })?;
                            if written != chunk.len() {
                                return Err(Error::Write {
                                    path: full_path.clone(),
                                    source: std::io::Error::new(
                                        std::io::ErrorKind::WriteZero,
                                        "short write to NTFS attribute",
                                    ),
                                });
                            }
                            Ok(())
                        })
                    }
                },
            };
            self.vol.attr_close(attr);
            result?;
        }
        Ok(())
    }

    fn apply_metadata(&mut self, did: DentryId, ni: &mut V::Inode) -> Result<()> {
        let tree = self.tree;
        let security = self.security;
        let inode = tree.inode_of(did);
        let full_path = &tree[did].full_path;

        debug!(
            "setting NTFS file attributes on {full_path} to {:#x}",
            inode.attributes
        );
        if let Err(e) = self.vol.set_attributes(ni, inode.attributes) {
            error!("failed to set NTFS file attributes on {full_path}: {e}");
            return Err(Error::Ntfs3g);
        }

        if let Some(security_id) = inode.security_id {
            let descriptor = security.get(security_id).ok_or_else(|| {
                Error::InvalidDentry(format!(
                    "{full_path} references security descriptor {security_id} \
                     which does not exist"
                ))
            })?;
            debug!("applying security descriptor {security_id} to {full_path}");
            if let Err(e) = self
                .vol
                .set_security(ni, ALL_SECURITY_INFORMATION, descriptor)
            {
                error!("failed to set security data on {full_path}: {e}");
                return Err(Error::Ntfs3g);
            }
        }
        Ok(())
    }

    /// Re-prefixes the stored reparse body with its `(tag, length, 0)`
    /// header and hands it to the volume. The body must be shorter than
    /// 0xFFFF bytes.
    fn apply_reparse(&mut self, did: DentryId, ni: &mut V::Inode) -> Result<()> {
        let tree = self.tree;
        let table = self.table;
        let inode = tree.inode_of(did);
        let full_path = &tree[did].full_path;
        debug!("applying reparse data to {full_path}");

        let Some(hash) = inode.unnamed_stream else {
            error!("could not find reparse data for {full_path}");
            return Err(Error::InvalidDentry(format!(
                "{full_path} has no reparse data"
            )));
        };
        let entry = table.lookup(&hash).ok_or_else(|| {
            Error::InvalidDentry(format!(
                "reparse data of {full_path} is missing from the lookup table"
            ))
        })?;
        if entry.original_size >= 0xffff {
            error!(
                "reparse data of {full_path} is too long ({} bytes)",
                entry.original_size
            );
            return Err(Error::InvalidDentry(format!(
                "reparse data of {full_path} is too long"
            )));
        }
        let tag = inode.reparse_tag.ok_or_else(|| {
            Error::InvalidDentry(format!("{full_path} has no reparse tag"))
        })?;

        let body = entry.read_all(self.resources.as_deref_mut())?;
        let header = ReparseHeader {
            tag: U32::new(tag),
            data_len: U16::new(body.len() as u16),
            reserved: U16::new(0),
        };
        let mut buffer = header.as_bytes().to_vec();
        buffer.extend_from_slice(&body);

        if let Err(e) = self.vol.set_reparse_data(ni, &buffer) {
            error!("failed to set NTFS reparse data on {full_path}: {e}");
            return Err(Error::Ntfs3g);
        }
        Ok(())
    }

    /// Binds the DOS (short) name, if the dentry carries one, then closes
    /// both handles. After a hard link the handles are closed and reopened
    /// first: the DOS-name call would otherwise close them in the wrong
    /// order.
    fn set_dos_name_and_close(
        &mut self,
        did: DentryId,
        ni: V::Inode,
        dir_ni: V::Inode,
        is_hardlink: bool,
    ) -> Result<()> {
        let tree = self.tree;
        let Some(short_name) = tree[did].short_name.as_deref() else {
            return self.finish(Ok(()), Some(ni), Some(dir_ni));
        };
        let short_name = match utf16_to_utf8(short_name) {
            Ok(s) => s,
            Err(e) => return self.finish(Err(e), Some(ni), Some(dir_ni)),
        };

        let mut ni = ni;
        let mut dir_ni = dir_ni;
        let mut close_failed = false;
        if is_hardlink {
            if !self.close_quiet(dir_ni, "directory inode") {
                close_failed = true;
            }
            if !self.close_quiet(ni, "hard link target inode") {
                close_failed = true;
            }
            let parent_path = self.parent_path(did);
            dir_ni = self.try_open(&parent_path)?;
            ni = match self.try_open(&tree[did].full_path) {
                Ok(ni) => ni,
                Err(e) => return self.finish(Err(e), None, Some(dir_ni)),
            };
        }

        debug!(
            "setting short (DOS) name of {} to {short_name:?}",
            tree[did].full_path
        );
        // the volume closes both inodes, success or failure
        match self.vol.set_dos_name(ni, dir_ni, &short_name) {
            Ok(()) if close_failed => Err(Error::Ntfs3g),
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    "could not set DOS (short) name for {}: {e}",
                    tree[did].full_path
                );
                Err(Error::Ntfs3g)
            }
        }
    }

    fn apply_timestamps(&mut self, did: DentryId) -> Result<()> {
        let tree = self.tree;
        debug!("setting timestamps on {}", tree[did].full_path);
        let mut ni = self.try_open(&tree[did].full_path)?;
        let times = tree.inode_of(did).times();
        let ret = self.vol.set_times(&mut ni, times).map_err(|e| {
            error!(
                "failed to set NTFS timestamps on {}: {e}",
                tree[did].full_path
            );
            Error::Ntfs3g
        });
        self.finish(ret, Some(ni), None)
    }
}

/// Applies one image of `wim` onto a mounted NTFS volume.
///
/// The volume should carry an empty filesystem. Mounting and unmounting
/// the device are the caller's concern, through whatever NTFS
/// implementation backs [`NtfsVolume`].
///
/// `image` is the 1-based image index; [`ALL_IMAGES`] is rejected, as are
/// the symlink/hardlink extraction styles, which cannot apply to an NTFS
/// volume.
pub fn apply_image_to_ntfs_volume<V: NtfsVolume>(
    wim: &mut Wim,
    image: usize,
    volume: &mut V,
    flags: ExtractFlags,
) -> Result<()> {
    if image == ALL_IMAGES {
        error!("can only apply a single image when applying directly to an NTFS volume");
        return Err(Error::InvalidParam(
            "cannot apply all images to one NTFS volume",
        ));
    }
    if flags.contains(ExtractFlags::SYMLINK) || flags.contains(ExtractFlags::HARDLINK) {
        error!("cannot specify symlink or hardlink flags when applying to an NTFS volume");
        return Err(Error::InvalidParam(
            "symlink and hardlink extraction styles do not apply to NTFS volumes",
        ));
    }

    let (imd, table, resources) = wim.apply_parts(image)?;
    let mut applier = Applier {
        vol: volume,
        tree: &imd.tree,
        table,
        security: &imd.security,
        resources,
        extracted: HashMap::new(),
        verbose: flags.contains(ExtractFlags::VERBOSE),
    };

    for did in imd.tree.descendants_preorder(imd.root) {
        applier.apply_dentry(did)?;
    }

    debug!("setting NTFS timestamps");
    for did in imd.tree.descendants_postorder(imd.root) {
        applier.apply_timestamps(did)?;
    }
    Ok(())
}
