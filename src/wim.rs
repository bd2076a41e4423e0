//! The archive facade: image metadata slots over a shared stream table.
//!
//! The on-disk container format is handled by an external reader/writer;
//! this type is the in-memory meeting point. The capture engine appends
//! populated metadata slots here, and the container writer serialises
//! them. In-archive stream content is reached through a pluggable
//! [`WimResourceReader`].

use log::{debug, error};
use rand::RngCore;

use crate::error::{Error, Result};
use crate::lookup::{
    ResourceLocation, Sha1Digest, StreamEntry, StreamTable, WimResourceReader,
    RESHDR_FLAG_METADATA,
};
use crate::security::SdSet;
use crate::tree::{DentryId, ImageTree, InodeId};

/// Selects every image of an archive where a single image index is
/// expected; always rejected by operations that need exactly one.
pub const ALL_IMAGES: usize = usize::MAX;

/// The per-image record appended to the archive.
#[derive(Debug)]
pub struct ImageMetadata {
    /// Image name, unique within the archive.
    pub name: String,
    /// The dentry/inode arenas of this image.
    pub tree: ImageTree,
    /// Root dentry of the image.
    pub root: DentryId,
    /// Hash of the metadata stream entry owned by this slot. A random
    /// placeholder until the container writer serialises the metadata.
    pub metadata_hash: Sha1Digest,
    /// The image's security descriptors.
    pub security: SdSet,
    /// Live inodes in tree order, grouped and numbered.
    pub inodes: Vec<InodeId>,
    /// Whether the in-memory metadata differs from what is on disk.
    pub modified: bool,
}

/// An archive being assembled or rewritten.
pub struct Wim {
    /// The content store shared by every image in the archive.
    pub lookup_table: StreamTable,
    images: Vec<ImageMetadata>,
    boot_index: usize,
    total_parts: u16,
    resource_reader: Option<Box<dyn WimResourceReader>>,
}

impl std::fmt::Debug for Wim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wim")
            .field("images", &self.images.len())
            .field("streams", &self.lookup_table.len())
            .field("boot_index", &self.boot_index)
            .field("total_parts", &self.total_parts)
            .finish()
    }
}

impl Default for Wim {
    fn default() -> Self {
        Self::new()
    }
}

impl Wim {
    /// Creates an empty single-part archive.
    pub fn new() -> Self {
        Self {
            lookup_table: StreamTable::new(),
            images: vec![],
            boot_index: 0,
            total_parts: 1,
            resource_reader: None,
        }
    }

    /// Number of images in the archive.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// The images, in index order.
    pub fn images(&self) -> impl Iterator<Item = &ImageMetadata> {
        self.images.iter()
    }

    /// The image with the given 1-based index.
    pub fn image(&self, index: usize) -> Result<&ImageMetadata> {
        if index == 0 || index > self.images.len() {
            error!("image {index} does not exist in the archive");
            return Err(Error::InvalidParam("no such image"));
        }
        Ok(&self.images[index - 1])
    }

    /// The image with the given 1-based index, mutably.
    pub fn image_mut(&mut self, index: usize) -> Result<&mut ImageMetadata> {
        self.image(index)?;
        Ok(&mut self.images[index - 1])
    }

    /// Whether an image with this name exists.
    pub fn image_name_in_use(&self, name: &str) -> bool {
        self.images.iter().any(|imd| imd.name == name)
    }

    /// The 1-based boot image index, 0 when none is set.
    pub fn boot_index(&self) -> usize {
        self.boot_index
    }

    /// Marks the image with the given 1-based index as the boot image.
    pub fn set_boot_index(&mut self, index: usize) -> Result<()> {
        self.image(index)?;
        self.boot_index = index;
        Ok(())
    }

    /// Number of parts of the on-disk archive. Images can only be added to
    /// single-part archives.
    pub fn total_parts(&self) -> u16 {
        self.total_parts
    }

    /// Records the part count read from the container header.
    pub fn set_total_parts(&mut self, total_parts: u16) {
        self.total_parts = total_parts;
    }

    /// Attaches the container's resource reader, giving the apply engine
    /// access to streams stored inside the archive.
    pub fn set_resource_reader(&mut self, reader: Box<dyn WimResourceReader>) {
        self.resource_reader = Some(reader);
    }

    /// Appends a populated image-metadata slot.
    ///
    /// The slot owns a fresh metadata stream entry carrying a random
    /// placeholder hash and the metadata flag; the container writer
    /// replaces both when it serialises the image.
    pub(crate) fn append_image(
        &mut self,
        name: &str,
        tree: ImageTree,
        root: DentryId,
        security: SdSet,
        inodes: Vec<InodeId>,
    ) {
        debug!(
            "appending image metadata slot for image_count = {}",
            self.images.len() + 1
        );
        let mut metadata_hash: Sha1Digest = [0; 20];
        rand::rng().fill_bytes(&mut metadata_hash);
        self.lookup_table.insert(StreamEntry {
            hash: metadata_hash,
            refcount: 1,
            location: ResourceLocation::AttachedBuffer(Box::new([])),
            original_size: 0,
            stored_size: 0,
            flags: RESHDR_FLAG_METADATA,
        });
        self.images.push(ImageMetadata {
            name: name.to_owned(),
            tree,
            root,
            metadata_hash,
            security,
            inodes,
            modified: true,
        });
    }

    /// Removes an image from the archive, releasing its metadata slot and
    /// every stream reference its tree holds. Later images shift down one
    /// index; the boot index follows.
    pub fn delete_image(&mut self, index: usize) -> Result<()> {
        self.image(index)?;
        let imd = self.images.remove(index - 1);
        self.lookup_table.unref(&imd.metadata_hash);
        imd.tree.release_streams(imd.root, &mut self.lookup_table);
        if self.boot_index == index {
            self.boot_index = 0;
        } else if self.boot_index > index {
            self.boot_index -= 1;
        }
        Ok(())
    }

    /// Splits the archive into the parts the apply engine needs: one image,
    /// the shared stream table, and the optional in-archive resource
    /// reader.
    pub(crate) fn apply_parts(
        &mut self,
        index: usize,
    ) -> Result<(
        &ImageMetadata,
        &StreamTable,
        Option<&mut dyn WimResourceReader + '_>,
    )> {
        if index == 0 || index > self.images.len() {
            error!("image {index} does not exist in the archive");
            return Err(Error::InvalidParam("no such image"));
        }
        Ok((
            &self.images[index - 1],
            &self.lookup_table,
            self.resource_reader.as_deref_mut(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Inode, FILE_ATTRIBUTE_DIRECTORY};

    fn empty_image(wim: &mut Wim, name: &str) {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry(
            "",
            Inode {
                attributes: FILE_ATTRIBUTE_DIRECTORY,
                creation_time: 0,
                last_write_time: 0,
                last_access_time: 0,
                reparse_tag: None,
                security_id: None,
                unnamed_stream: None,
                ads: vec![],
                ino: 0,
                dev: 0,
                links: vec![],
                unix_data: None,
            },
        );
        tree.compute_full_paths(root);
        let inodes = tree.assign_link_groups(root);
        wim.append_image(name, tree, root, SdSet::new(), inodes);
    }

    #[test]
    fn test_image_indexing_is_one_based() {
        let mut wim = Wim::new();
        empty_image(&mut wim, "first");
        assert!(wim.image(0).is_err());
        assert!(wim.image(1).is_ok());
        assert!(wim.image(2).is_err());
    }

    #[test]
    fn test_metadata_slot_owns_placeholder_entry() {
        let mut wim = Wim::new();
        empty_image(&mut wim, "first");
        let hash = wim.image(1).unwrap().metadata_hash;
        let entry = wim.lookup_table.lookup(&hash).unwrap();
        assert!(entry.is_metadata());
        assert_eq!(entry.refcount, 1);
    }

    #[test]
    fn test_delete_image_releases_slot_and_adjusts_boot() {
        let mut wim = Wim::new();
        empty_image(&mut wim, "a");
        empty_image(&mut wim, "b");
        empty_image(&mut wim, "c");
        wim.set_boot_index(3).unwrap();

        wim.delete_image(1).unwrap();
        assert_eq!(wim.image_count(), 2);
        assert_eq!(wim.boot_index(), 2);
        assert_eq!(wim.image(1).unwrap().name, "b");

        wim.delete_image(2).unwrap();
        assert_eq!(wim.boot_index(), 0);
        // only the remaining image's metadata entry is left
        assert_eq!(wim.lookup_table.len(), 1);
    }

    #[test]
    fn test_name_lookup() {
        let mut wim = Wim::new();
        empty_image(&mut wim, "winpe");
        assert!(wim.image_name_in_use("winpe"));
        assert!(!wim.image_name_in_use("other"));
    }
}
