//! The in-memory image model: a tree of directory entries (dentries) over
//! an inode table with hard-link groups.
//!
//! Dentries and inodes live in per-image arenas and refer to each other by
//! index. A dentry owns its place in its parent's child map; an inode owns
//! its stream references and the list of dentries that link to it. Stream
//! content itself is shared through the refcounted
//! [`StreamTable`](crate::lookup::StreamTable).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Index, IndexMut};

use log::{debug, warn};

use crate::lookup::{Sha1Digest, StreamTable};
use crate::util::now_wim_timestamp;

/// File attribute bits stored on an inode (the Windows set).
pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0004;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0010;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0080;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0400;

/// Reparse tag of an NTFS junction (mount point).
pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;

/// Reparse tag of a symbolic link.
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Index of a dentry within its image's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DentryId(u32);

/// Index of an inode within its image's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(u32);

/// Child-map key with NTFS collation: names order case-insensitively, with
/// a case-sensitive tiebreak so names differing only in case both survive.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChildName(String);

fn caseless_cmp(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

impl Ord for ChildName {
    fn cmp(&self, other: &Self) -> Ordering {
        caseless_cmp(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ChildName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A named alternate data stream attached to an inode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdsEntry {
    /// Stream name (never empty; the unnamed stream lives on the inode).
    pub name: String,
    /// Digest of the stream content; `None` for an empty stream.
    pub stream: Option<Sha1Digest>,
}

/// UNIX ownership and permissions, recorded under the `UNIX_DATA` flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnixData {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// The identity of a file: everything about it except its name(s).
#[derive(Debug)]
pub struct Inode {
    /// `FILE_ATTRIBUTE_*` bits.
    pub attributes: u32,
    /// Creation time, 100-ns ticks since the Windows epoch.
    pub creation_time: u64,
    /// Last-write time, 100-ns ticks since the Windows epoch.
    pub last_write_time: u64,
    /// Last-access time, 100-ns ticks since the Windows epoch.
    pub last_access_time: u64,
    /// Reparse tag, present iff this is a reparse point.
    pub reparse_tag: Option<u32>,
    /// Index into the image's security-descriptor set.
    pub security_id: Option<u32>,
    /// Digest of the unnamed data stream; `None` when it is empty. For a
    /// reparse point this is the reparse data body (without the 8-byte
    /// header).
    pub unnamed_stream: Option<Sha1Digest>,
    /// Named alternate data streams, in capture order.
    pub ads: Vec<AdsEntry>,
    /// Inode number: the capture-time number until
    /// [`ImageTree::assign_link_groups`] renumbers, fresh afterwards.
    pub ino: u64,
    /// Capture-time device, used to group hard links; zero afterwards.
    pub dev: u64,
    /// The dentries sharing this inode (the hard-link group).
    pub links: Vec<DentryId>,
    /// UNIX ownership/mode, if captured.
    pub unix_data: Option<UnixData>,
}

impl Inode {
    /// Whether this inode is a directory (and not a reparse point such as
    /// a junction).
    pub fn is_directory(&self) -> bool {
        self.attributes & (FILE_ATTRIBUTE_DIRECTORY | FILE_ATTRIBUTE_REPARSE_POINT)
            == FILE_ATTRIBUTE_DIRECTORY
    }

    /// Whether this inode is a reparse point.
    pub fn is_reparse(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }

    /// The `(creation, last write, last access)` triple.
    pub fn times(&self) -> [u64; 3] {
        [
            self.creation_time,
            self.last_write_time,
            self.last_access_time,
        ]
    }

    fn same_identity(&self, other: &Inode) -> bool {
        self.attributes == other.attributes && self.unnamed_stream == other.unnamed_stream
    }
}

/// A node in an image's directory tree: a name bound to an inode.
#[derive(Debug)]
pub struct Dentry {
    /// UTF-8 long name; empty for the image root.
    pub name: String,
    /// Optional 8.3 short name in UTF-16.
    pub short_name: Option<Box<[u16]>>,
    /// The containing directory; `None` for the image root.
    pub parent: Option<DentryId>,
    /// The inode this dentry names.
    pub inode: InodeId,
    /// Full image path, computed by [`ImageTree::compute_full_paths`].
    pub full_path: String,
    children: BTreeMap<ChildName, DentryId>,
}

impl Dentry {
    /// Whether this dentry is an image root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// The per-image arenas holding every dentry and inode of one image.
#[derive(Debug, Default)]
pub struct ImageTree {
    dentries: Vec<Dentry>,
    inodes: Vec<Inode>,
}

impl Index<DentryId> for ImageTree {
    type Output = Dentry;
    fn index(&self, id: DentryId) -> &Dentry {
        &self.dentries[id.0 as usize]
    }
}

impl IndexMut<DentryId> for ImageTree {
    fn index_mut(&mut self, id: DentryId) -> &mut Dentry {
        &mut self.dentries[id.0 as usize]
    }
}

impl Index<InodeId> for ImageTree {
    type Output = Inode;
    fn index(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0 as usize]
    }
}

impl IndexMut<InodeId> for ImageTree {
    fn index_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0 as usize]
    }
}

impl ImageTree {
    /// Creates empty arenas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dentry named `name` over a fresh inode, not yet attached
    /// anywhere.
    pub fn new_dentry(&mut self, name: impl Into<String>, inode: Inode) -> DentryId {
        let iid = InodeId(self.inodes.len() as u32);
        self.inodes.push(inode);
        let did = DentryId(self.dentries.len() as u32);
        self.dentries.push(Dentry {
            name: name.into(),
            short_name: None,
            parent: None,
            inode: iid,
            full_path: String::new(),
            children: BTreeMap::new(),
        });
        self.inodes[iid.0 as usize].links.push(did);
        did
    }

    /// Creates a synthetic directory to host a target path whose
    /// intermediate components exist in no capture source. The final inode
    /// number is assigned later by [`ImageTree::assign_link_groups`].
    pub fn new_filler_directory(&mut self, name: impl Into<String>) -> DentryId {
        let name = name.into();
        debug!("creating filler directory {name:?}");
        let now = now_wim_timestamp();
        self.new_dentry(
            name,
            Inode {
                attributes: FILE_ATTRIBUTE_DIRECTORY,
                creation_time: now,
                last_write_time: now,
                last_access_time: now,
                reparse_tag: None,
                security_id: None,
                unnamed_stream: None,
                ads: vec![],
                ino: 0,
                dev: 0,
                links: vec![],
                unix_data: None,
            },
        )
    }

    /// The inode of a dentry.
    pub fn inode_of(&self, did: DentryId) -> &Inode {
        &self[self[did].inode]
    }

    /// The inode of a dentry, mutably.
    pub fn inode_of_mut(&mut self, did: DentryId) -> &mut Inode {
        let iid = self[did].inode;
        &mut self[iid]
    }

    /// Adds `child` to `parent`'s child set and records the back-reference.
    ///
    /// On a name collision the tree is unchanged and the existing child is
    /// returned as the error.
    pub fn add_child(&mut self, parent: DentryId, child: DentryId) -> Result<(), DentryId> {
        let key = ChildName(self[child].name.clone());
        if let Some(&existing) = self[parent].children.get(&key) {
            return Err(existing);
        }
        self[parent].children.insert(key, child);
        self[child].parent = Some(parent);
        Ok(())
    }

    /// Looks up a child of `parent` by exact name.
    pub fn get_child(&self, parent: DentryId, name: &str) -> Option<DentryId> {
        self[parent]
            .children
            .get(&ChildName(name.to_owned()))
            .copied()
    }

    /// The first child of `parent` in collation order.
    pub fn first_child(&self, parent: DentryId) -> Option<DentryId> {
        self[parent].children.values().next().copied()
    }

    /// Detaches `child` from `parent`, clearing the back-reference.
    pub fn detach_child(&mut self, parent: DentryId, child: DentryId) {
        let key = ChildName(self[child].name.clone());
        let removed = self[parent].children.remove(&key);
        debug_assert_eq!(removed, Some(child));
        self[child].parent = None;
    }

    /// The children of `id`, in collation order.
    pub fn children(&self, id: DentryId) -> impl Iterator<Item = DentryId> + '_ {
        self[id].children.values().copied()
    }

    /// Renames a dentry. The dentry must not currently be attached to a
    /// parent (its key in the child map would go stale).
    pub fn set_dentry_name(&mut self, did: DentryId, name: &str) {
        debug_assert!(self[did].parent.is_none());
        self[did].name = name.to_owned();
    }

    /// Every dentry under `root` (inclusive), parents before children.
    pub fn descendants_preorder(&self, root: DentryId) -> Vec<DentryId> {
        let mut out = vec![];
        let mut stack = vec![root];
        while let Some(did) = stack.pop() {
            out.push(did);
            // reversed so that children pop in collation order
            stack.extend(self[did].children.values().rev().copied());
        }
        out
    }

    /// Every dentry under `root` (inclusive), children before parents.
    pub fn descendants_postorder(&self, root: DentryId) -> Vec<DentryId> {
        fn walk(tree: &ImageTree, did: DentryId, out: &mut Vec<DentryId>) {
            let children: Vec<DentryId> = tree.children(did).collect();
            for child in children {
                walk(tree, child, out);
            }
            out.push(did);
        }
        let mut out = vec![];
        walk(self, root, &mut out);
        out
    }

    /// Computes the full image path of every dentry under `root`. The root
    /// itself is `/`.
    pub fn compute_full_paths(&mut self, root: DentryId) {
        self[root].full_path = "/".to_owned();
        for did in self.descendants_preorder(root) {
            if did == root {
                continue;
            }
            let parent = self[did].parent.expect("non-root dentry has a parent");
            let parent_path = self[parent].full_path.clone();
            let name = self[did].name.clone();
            self[did].full_path = if parent_path == "/" {
                format!("/{name}")
            } else {
                format!("{parent_path}/{name}")
            };
        }
    }

    /// Drops one table reference for every stream reachable from every
    /// dentry under `root`. Used to roll back a partially built branch or
    /// to destroy a released image.
    pub fn release_streams(&self, root: DentryId, table: &mut StreamTable) {
        for did in self.descendants_preorder(root) {
            let inode = self.inode_of(did);
            if let Some(hash) = &inode.unnamed_stream {
                table.unref(hash);
            }
            for ads in &inode.ads {
                if let Some(hash) = &ads.stream {
                    table.unref(hash);
                }
            }
        }
    }

    /// Merges dentries that captured the same `(dev, ino)` into hard-link
    /// groups, then assigns fresh inode numbers group by group.
    ///
    /// Directories and filler nodes (inode number 0) are never merged.
    /// Returns the image's live inodes in tree order.
    pub fn assign_link_groups(&mut self, root: DentryId) -> Vec<InodeId> {
        let order = self.descendants_preorder(root);

        let mut by_key: HashMap<(u64, u64), InodeId> = HashMap::new();
        for &did in &order {
            let iid = self[did].inode;
            let (dev, ino, is_dir) = {
                let inode = &self[iid];
                (inode.dev, inode.ino, inode.is_directory())
            };
            if ino == 0 || is_dir {
                continue;
            }
            match by_key.entry((dev, ino)) {
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(iid);
                }
                std::collections::hash_map::Entry::Occupied(o) => {
                    let canon = *o.get();
                    if canon == iid {
                        continue;
                    }
                    if !self[canon].same_identity(&self[iid]) {
                        warn!(
                            "inconsistent metadata in hard-link group of {:?}; \
                             keeping the first capture",
                            self[did].name
                        );
                    }
                    let moved = std::mem::take(&mut self.inode_of_mut(did).links);
                    for &d in &moved {
                        self[d].inode = canon;
                    }
                    let canon_inode = &mut self[canon];
                    canon_inode.links.extend(moved);
                }
            }
        }

        // fresh inode numbers, one per group, in tree order
        let mut live = vec![];
        let mut seen = std::collections::HashSet::new();
        let mut next = 1u64;
        for &did in &order {
            let iid = self[did].inode;
            if !seen.insert(iid) {
                continue;
            }
            let inode = &mut self[iid];
            inode.ino = next;
            inode.dev = 0;
            next += 1;
            live.push(iid);
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{sha1_buf, ResourceLocation, StreamTable};

    fn file_inode(ino: u64, stream: Option<Sha1Digest>) -> Inode {
        Inode {
            attributes: FILE_ATTRIBUTE_NORMAL,
            creation_time: 1,
            last_write_time: 2,
            last_access_time: 3,
            reparse_tag: None,
            security_id: None,
            unnamed_stream: stream,
            ads: vec![],
            ino,
            dev: 1,
            links: vec![],
            unix_data: None,
        }
    }

    fn dir_inode() -> Inode {
        Inode {
            attributes: FILE_ATTRIBUTE_DIRECTORY,
            ..file_inode(0, None)
        }
    }

    #[test]
    fn test_children_collate_case_insensitively() {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry("", dir_inode());
        for name in ["zebra", "Apple", "apple", "Mango"] {
            let child = tree.new_dentry(name, file_inode(0, None));
            tree.add_child(root, child).unwrap();
        }
        let names: Vec<&str> = tree
            .children(root)
            .map(|d| tree[d].name.as_str())
            .collect();
        assert_eq!(names, ["Apple", "apple", "Mango", "zebra"]);
    }

    #[test]
    fn test_add_child_collision() {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry("", dir_inode());
        let a = tree.new_dentry("f1", file_inode(0, None));
        let b = tree.new_dentry("f1", file_inode(0, None));
        tree.add_child(root, a).unwrap();
        assert_eq!(tree.add_child(root, b), Err(a));
        assert_eq!(tree[root].child_count(), 1);
        assert!(tree[b].parent.is_none());
    }

    #[test]
    fn test_exact_lookup_is_case_sensitive() {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry("", dir_inode());
        let a = tree.new_dentry("Readme", file_inode(0, None));
        tree.add_child(root, a).unwrap();
        assert_eq!(tree.get_child(root, "Readme"), Some(a));
        assert_eq!(tree.get_child(root, "README"), None);
    }

    #[test]
    fn test_full_paths() {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry("", dir_inode());
        let d = tree.new_dentry("d", dir_inode());
        let f = tree.new_dentry("f.txt", file_inode(0, None));
        tree.add_child(root, d).unwrap();
        tree.add_child(d, f).unwrap();
        tree.compute_full_paths(root);
        assert_eq!(tree[root].full_path, "/");
        assert_eq!(tree[d].full_path, "/d");
        assert_eq!(tree[f].full_path, "/d/f.txt");
    }

    #[test]
    fn test_traversal_orders() {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry("", dir_inode());
        let d = tree.new_dentry("d", dir_inode());
        let a = tree.new_dentry("a", file_inode(0, None));
        let x = tree.new_dentry("x", file_inode(0, None));
        tree.add_child(root, d).unwrap();
        tree.add_child(root, a).unwrap();
        tree.add_child(d, x).unwrap();

        let pre: Vec<&str> = tree
            .descendants_preorder(root)
            .iter()
            .map(|&d| tree[d].name.as_str())
            .collect();
        assert_eq!(pre, ["", "a", "d", "x"]);

        let post: Vec<&str> = tree
            .descendants_postorder(root)
            .iter()
            .map(|&d| tree[d].name.as_str())
            .collect();
        assert_eq!(post, ["a", "x", "d", ""]);
    }

    #[test]
    fn test_assign_link_groups_merges_same_ino() {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry("", dir_inode());
        let hash = sha1_buf(b"shared");
        let u = tree.new_dentry("u", file_inode(77, Some(hash)));
        let v = tree.new_dentry("v", file_inode(77, Some(hash)));
        let w = tree.new_dentry("w", file_inode(78, None));
        for d in [u, v, w] {
            tree.add_child(root, d).unwrap();
        }

        let live = tree.assign_link_groups(root);
        assert_eq!(tree[u].inode, tree[v].inode);
        assert_ne!(tree[u].inode, tree[w].inode);
        assert_eq!(tree.inode_of(u).links.len(), 2);
        // root + merged group + w
        assert_eq!(live.len(), 3);

        // fresh numbers are unique and nonzero
        let mut numbers: Vec<u64> = live.iter().map(|&i| tree[i].ino).collect();
        numbers.sort_unstable();
        numbers.dedup();
        assert_eq!(numbers.len(), 3);
        assert!(numbers.iter().all(|&n| n > 0));
    }

    #[test]
    fn test_directories_never_merge() {
        let mut tree = ImageTree::new();
        let root = tree.new_dentry("", dir_inode());
        let mut da = dir_inode();
        da.ino = 9;
        let mut db = dir_inode();
        db.ino = 9;
        let a = tree.new_dentry("a", da);
        let b = tree.new_dentry("b", db);
        tree.add_child(root, a).unwrap();
        tree.add_child(root, b).unwrap();
        tree.assign_link_groups(root);
        assert_ne!(tree[a].inode, tree[b].inode);
    }

    #[test]
    fn test_release_streams_decrements_per_dentry() {
        let mut tree = ImageTree::new();
        let mut table = StreamTable::new();
        let data = b"content".as_slice();
        let hash = sha1_buf(data);

        let root = tree.new_dentry("", dir_inode());
        for name in ["x", "y"] {
            let d = tree.new_dentry(name, file_inode(5, Some(hash)));
            tree.add_child(root, d).unwrap();
            table.add_or_ref(hash, || {
                (ResourceLocation::AttachedBuffer(data.into()), 7)
            });
        }
        assert_eq!(table.lookup(&hash).unwrap().refcount, 2);

        tree.assign_link_groups(root);
        tree.release_streams(root, &mut table);
        assert!(table.is_empty());
    }
}
