//! Building images from capture sources.
//!
//! One branch is captured per source by walking the tree through a
//! [`CaptureSource`]; branches are then assembled into a single image tree
//! (synthesising filler directories and overlaying where target paths
//! meet), and the finished tree is appended to the archive as a new image
//! metadata slot. Failures roll the whole image back: every stream
//! reference taken during the scan is released again.

use std::path::Path;

use log::{debug, error, warn};

use crate::config::{CaptureConfig, DEFAULT_CONFIG};
use crate::error::{Error, Result};
use crate::lookup::{sha1_buf, ResourceLocation, StreamTable};
use crate::progress::ProgressEvent;
use crate::security::SdSet;
use crate::source::{CaptureSource, CapturedStream, NodeInfo, PosixSource};
use crate::tree::{AdsEntry, DentryId, ImageTree, Inode};
use crate::util::path_basename;
use crate::wim::Wim;

/// Flags accepted by the `add_image` operations.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct AddImageFlags(u32);

impl AddImageFlags {
    /// Capture directly from an NTFS volume.
    pub const NTFS: Self = Self(0x0000_0001);
    /// Follow symbolic links instead of archiving them.
    pub const DEREFERENCE: Self = Self(0x0000_0002);
    /// Report every scanned path through the progress callback.
    pub const VERBOSE: Self = Self(0x0000_0004);
    /// Mark the new image as the boot image.
    pub const BOOT: Self = Self(0x0000_0008);
    /// Record UNIX owner, group and mode bits.
    pub const UNIX_DATA: Self = Self(0x0000_0010);
    /// The node being captured is the root of the image.
    pub(crate) const ROOT: Self = Self(0x8000_0000);
    /// The node being captured is the root of one capture source.
    pub(crate) const SOURCE: Self = Self(0x4000_0000);

    /// No flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for AddImageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for AddImageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One capture source: a filesystem path and the path inside the image
/// where its content lands.
#[derive(Clone, Debug)]
pub struct CaptureSourceSpec {
    /// The tree (or file) on disk to capture.
    pub fs_source_path: std::path::PathBuf,
    /// Destination inside the image; empty means the image root.
    pub wim_target_path: String,
}

type Progress<'a, 'p> = Option<&'a mut (dyn FnMut(&ProgressEvent<'_>) + 'p)>;

struct CaptureCtx<'t, 'b, 's, 'c, 'p> {
    tree: &'t mut ImageTree,
    table: &'b mut StreamTable,
    sd_set: &'s mut SdSet,
    config: &'c CaptureConfig,
    progress: Progress<'p, 'p>,
}

impl CaptureCtx<'_, '_, '_, '_, '_> {
    fn emit(&mut self, event: ProgressEvent<'_>) {
        if let Some(f) = self.progress.as_mut() {
            f(&event);
        }
    }
}

/// Recursively builds one branch of the image from the on-disk tree at
/// `disk_path`.
///
/// Returns `None` (and no dentry) when the configuration excludes the
/// path. Errors release every stream reference the partial branch took.
fn build_dentry_tree(
    ctx: &mut CaptureCtx<'_, '_, '_, '_, '_>,
    src: &mut dyn CaptureSource,
    disk_path: &Path,
    mut flags: AddImageFlags,
) -> Result<Option<DentryId>> {
    let path_str = disk_path.to_str().ok_or(Error::InvalidUtf8String)?;

    if ctx.config.exclude_path(path_str, true) {
        if flags.contains(AddImageFlags::ROOT) {
            error!("cannot exclude the root directory from capture");
            return Err(Error::InvalidCaptureConfig(
                "the root of a capture source is excluded".into(),
            ));
        }
        if flags.contains(AddImageFlags::VERBOSE) {
            ctx.emit(ProgressEvent::ScanDentry {
                path: disk_path,
                excluded: true,
            });
        }
        debug!("excluding {path_str} from capture");
        return Ok(None);
    }
    if flags.contains(AddImageFlags::VERBOSE) {
        ctx.emit(ProgressEvent::ScanDentry {
            path: disk_path,
            excluded: false,
        });
    }

    let mut info = src.stat(disk_path, false)?;
    if flags.contains(AddImageFlags::ROOT) && !info.is_directory() {
        // The root of a source may be a symbolic link, provided it points
        // to a directory.
        info = src.stat(disk_path, true)?;
        if !info.is_directory() {
            error!("{path_str} is not a directory");
            return Err(Error::InvalidParam(
                "the root of a capture source must be a directory",
            ));
        }
    }

    let dentry = ctx.tree.new_dentry(
        path_basename(path_str),
        Inode {
            attributes: info.attributes,
            creation_time: info.creation_time,
            last_write_time: info.last_write_time,
            last_access_time: info.last_access_time,
            reparse_tag: None,
            security_id: None,
            unnamed_stream: None,
            ads: vec![],
            ino: info.ino,
            dev: info.dev,
            links: vec![],
            unix_data: if flags.contains(AddImageFlags::UNIX_DATA) {
                info.unix_data
            } else {
                None
            },
        },
    );
    flags.remove(AddImageFlags::ROOT | AddImageFlags::SOURCE);

    match capture_node(ctx, src, disk_path, dentry, &info, flags) {
        Ok(()) => Ok(Some(dentry)),
        Err(e) => {
            ctx.tree.release_streams(dentry, ctx.table);
            Err(e)
        }
    }
}

fn capture_node(
    ctx: &mut CaptureCtx<'_, '_, '_, '_, '_>,
    src: &mut dyn CaptureSource,
    disk_path: &Path,
    dentry: DentryId,
    info: &NodeInfo,
    flags: AddImageFlags,
) -> Result<()> {
    if let Some(short_name) = src.short_name(disk_path)? {
        ctx.tree[dentry].short_name = Some(short_name);
    }
    if let Some(descriptor) = src.security_descriptor(disk_path)? {
        let id = ctx.sd_set.add(&descriptor);
        ctx.tree.inode_of_mut(dentry).security_id = Some(id);
    }

    if info.is_reparse() {
        debug!("capturing reparse point {}", disk_path.display());
        let reparse = src.read_reparse(disk_path)?;
        let tag = reparse.tag;
        let stream = if reparse.body.is_empty() {
            None
        } else {
            let hash = sha1_buf(&reparse.body);
            let size = reparse.body.len() as u64;
            let body = reparse.body;
            ctx.table.add_or_ref(hash, move || {
                (
                    ResourceLocation::AttachedBuffer(body.into_boxed_slice()),
                    size,
                )
            });
            Some(hash)
        };
        let inode = ctx.tree.inode_of_mut(dentry);
        inode.reparse_tag = Some(tag);
        inode.unnamed_stream = stream;
    } else if info.is_directory() {
        debug!("recursing to directory {}", disk_path.display());
        for name in src.read_dir(disk_path)? {
            let child_path = disk_path.join(&name);
            if let Some(child) = build_dentry_tree(ctx, src, &child_path, flags)? {
                if ctx.tree.add_child(dentry, child).is_err() {
                    warn!(
                        "duplicate directory entry {name:?} in {}",
                        disk_path.display()
                    );
                    ctx.tree.release_streams(child, ctx.table);
                }
            }
        }
    } else {
        debug!("capturing streams of {}", disk_path.display());
        for stream in src.streams(disk_path)? {
            // the empty stream attaches no table entry
            let captured = if stream.size == 0 {
                None
            } else {
                src.capture_stream(disk_path, &stream.name)?
            };
            let hash = captured.map(|c| {
                let CapturedStream {
                    hash,
                    size,
                    location,
                } = c;
                ctx.table.add_or_ref(hash, move || (location, size));
                hash
            });
            let inode = ctx.tree.inode_of_mut(dentry);
            if stream.name.is_empty() {
                inode.unnamed_stream = hash;
            } else {
                inode.ads.push(AdsEntry {
                    name: stream.name,
                    stream: hash,
                });
            }
        }
    }
    Ok(())
}

/// Strips leading and trailing slashes from a target path.
fn canonicalize_target_path(target: &str) -> &str {
    target.trim_start_matches('/').trim_end_matches('/')
}

/// Validates the sorted source list.
fn check_sorted_sources(sources: &[CaptureSourceSpec], flags: AddImageFlags) -> Result<()> {
    if flags.contains(AddImageFlags::NTFS) {
        if sources.len() != 1 {
            error!("must specify exactly one capture source (the NTFS volume) in NTFS mode");
            return Err(Error::InvalidParam("NTFS capture takes exactly one source"));
        }
        if !sources[0].wim_target_path.is_empty() {
            error!("in NTFS capture mode the target path inside the image must be the root");
            return Err(Error::InvalidParam(
                "NTFS capture target must be the image root",
            ));
        }
    }
    // Duplicate and nested target paths in general mode resolve as
    // overlays when the branches are attached.
    Ok(())
}

/// Transfers the children of `branch` into `target`.
///
/// It is an error if `target` is not a directory or if both contain a
/// child with the same name.
fn do_overlay(tree: &mut ImageTree, target: DentryId, branch: DentryId) -> Result<()> {
    if !tree.inode_of(target).is_directory() {
        let name = tree[branch].name.clone();
        error!("cannot overlay directory {name:?} over a non-directory");
        return Err(Error::InvalidOverlay(format!(
            "{name:?} cannot be overlaid onto a non-directory"
        )));
    }
    while let Some(child) = tree.first_child(branch) {
        tree.detach_child(branch, child);
        if tree.add_child(target, child).is_err() {
            // put it back so the branch can still be released cleanly
            tree.add_child(branch, child)
                .expect("child was just detached");
            let name = tree[child].name.clone();
            error!(
                "overlay error: file {name:?} already exists as a child of {:?}",
                tree[target].name
            );
            return Err(Error::InvalidOverlay(format!(
                "file {name:?} already exists in the target directory"
            )));
        }
    }
    Ok(())
}

/// Attaches or overlays one captured branch at `target_path`, creating
/// filler directories for missing intermediate components.
fn attach_branch(
    tree: &mut ImageTree,
    table: &mut StreamTable,
    root: &mut Option<DentryId>,
    branch: DentryId,
    target_path: &str,
) -> Result<()> {
    if target_path.is_empty() {
        return match *root {
            Some(existing) => {
                do_overlay(tree, existing, branch)?;
                // the branch dentry itself is no longer reachable
                tree.release_streams(branch, table);
                Ok(())
            }
            None => {
                *root = Some(branch);
                Ok(())
            }
        };
    }

    let root_id = match *root {
        Some(r) => r,
        None => {
            let r = tree.new_filler_directory("");
            *root = Some(r);
            r
        }
    };

    let components: Vec<&str> = target_path.split('/').filter(|c| !c.is_empty()).collect();
    let (last, intermediate) = components
        .split_last()
        .expect("canonical non-empty target path");

    let mut parent = root_id;
    for comp in intermediate {
        parent = match tree.get_child(parent, comp) {
            Some(existing) => existing,
            None => {
                let filler = tree.new_filler_directory(*comp);
                tree.add_child(parent, filler).expect("name was absent");
                filler
            }
        };
    }

    match tree.get_child(parent, last) {
        Some(existing) => {
            do_overlay(tree, existing, branch)?;
            tree.release_streams(branch, table);
            Ok(())
        }
        None => {
            tree.add_child(parent, branch).expect("name was absent");
            Ok(())
        }
    }
}

fn emit(progress: &mut Progress<'_, '_>, event: ProgressEvent<'_>) {
    if let Some(f) = progress.as_mut() {
        f(&event);
    }
}

#[allow(clippy::too_many_arguments)]
fn build_sources(
    tree: &mut ImageTree,
    table: &mut StreamTable,
    sd_set: &mut SdSet,
    config: &mut CaptureConfig,
    src: &mut dyn CaptureSource,
    sources: &[CaptureSourceSpec],
    flags: AddImageFlags,
    progress: &mut Progress<'_, '_>,
    root: &mut Option<DentryId>,
) -> Result<()> {
    for (i, spec) in sources.iter().enumerate() {
        let progress = &mut *progress;
        debug!(
            "building dentry tree for source {} of {} ({:?} => {:?})",
            i + 1,
            sources.len(),
            spec.fs_source_path,
            spec.wim_target_path
        );
        emit(
            progress,
            ProgressEvent::ScanBegin {
                source: &spec.fs_source_path,
                target: &spec.wim_target_path,
            },
        );

        let prefix = spec
            .fs_source_path
            .to_str()
            .ok_or(Error::InvalidUtf8String)?;
        config.set_prefix(prefix);

        let mut src_flags = flags | AddImageFlags::SOURCE;
        if spec.wim_target_path.is_empty() {
            src_flags |= AddImageFlags::ROOT;
        }

        let mut ctx = CaptureCtx {
            tree: &mut *tree,
            table: &mut *table,
            sd_set: &mut *sd_set,
            config: &*config,
            progress: progress.as_deref_mut(),
        };
        let branch = build_dentry_tree(&mut ctx, src, &spec.fs_source_path, src_flags).map_err(
            |e| {
                error!(
                    "failed to build dentry tree for {:?}",
                    spec.fs_source_path
                );
                e
            },
        )?;

        if let Some(branch) = branch {
            // The branch takes the target's name, not the source's; this
            // also leaves the root of the whole image unnamed.
            ctx.tree
                .set_dentry_name(branch, path_basename(&spec.wim_target_path));
            if let Err(e) =
                attach_branch(ctx.tree, ctx.table, root, branch, &spec.wim_target_path)
            {
                ctx.tree.release_streams(branch, ctx.table);
                return Err(e);
            }
        }

        ctx.emit(ProgressEvent::ScanEnd {
            source: &spec.fs_source_path,
            target: &spec.wim_target_path,
        });
    }
    Ok(())
}

/// Captures a multi-source image through a caller-supplied backend.
///
/// This is the seam for NTFS-volume capture sources and other non-POSIX
/// backends; [`add_image_multisource`] wires the POSIX backend to it.
pub fn add_image_multisource_from(
    wim: &mut Wim,
    src: &mut dyn CaptureSource,
    sources: &[CaptureSourceSpec],
    name: &str,
    config_text: Option<&str>,
    flags: AddImageFlags,
    mut progress: Option<&mut dyn FnMut(&ProgressEvent<'_>)>,
) -> Result<()> {
    if flags.contains(AddImageFlags::NTFS) {
        if flags.contains(AddImageFlags::DEREFERENCE) {
            error!("cannot dereference files when capturing directly from NTFS");
            return Err(Error::InvalidParam(
                "NTFS capture cannot dereference symbolic links",
            ));
        }
        if flags.contains(AddImageFlags::UNIX_DATA) {
            error!("capturing UNIX owner and mode is not supported when capturing from NTFS");
            return Err(Error::InvalidParam("NTFS capture cannot record UNIX data"));
        }
    }
    if name.is_empty() {
        error!("must specify a non-empty string for the image name");
        return Err(Error::InvalidParam("image name must not be empty"));
    }
    if wim.total_parts() != 1 {
        error!("cannot add an image to a split archive");
        return Err(Error::SplitUnsupported);
    }
    if wim.image_name_in_use(name) {
        error!("there is already an image named {name:?} in the archive");
        return Err(Error::ImageNameCollision(name.to_owned()));
    }

    let config_text = match config_text {
        Some(text) => text,
        None => {
            debug!("using the default capture configuration");
            DEFAULT_CONFIG
        }
    };
    let mut config = CaptureConfig::parse(config_text)?;

    let mut sources: Vec<CaptureSourceSpec> = sources
        .iter()
        .map(|s| CaptureSourceSpec {
            fs_source_path: s.fs_source_path.clone(),
            wim_target_path: canonicalize_target_path(&s.wim_target_path).to_owned(),
        })
        .collect();
    // Containing paths sort first, so they are attached before the
    // branches that land inside them.
    sources.sort_by(|a, b| a.wim_target_path.cmp(&b.wim_target_path));
    check_sorted_sources(&sources, flags)?;

    debug!("using {} capture source(s)", sources.len());
    let mut tree = ImageTree::new();
    let mut sd_set = SdSet::new();
    let mut root: Option<DentryId> = None;

    if let Err(e) = build_sources(
        &mut tree,
        &mut wim.lookup_table,
        &mut sd_set,
        &mut config,
        src,
        &sources,
        flags,
        &mut progress,
        &mut root,
    ) {
        if let Some(r) = root {
            tree.release_streams(r, &mut wim.lookup_table);
        }
        return Err(e);
    }
    let root = root.unwrap_or_else(|| tree.new_filler_directory(""));

    debug!("calculating full paths of dentries");
    tree.compute_full_paths(root);
    debug!("assigning hard link group IDs");
    let inodes = tree.assign_link_groups(root);

    wim.append_image(name, tree, root, sd_set, inodes);
    if flags.contains(AddImageFlags::BOOT) {
        let boot = wim.image_count();
        wim.set_boot_index(boot)?;
    }
    Ok(())
}

/// Captures a new image from multiple sources into `wim`.
///
/// Targets are canonicalised and sorted so containing paths attach first;
/// missing intermediate directories are synthesised; sources meeting at
/// the same target overlay. With no configuration text the embedded
/// default exclusion list is used.
pub fn add_image_multisource(
    wim: &mut Wim,
    sources: &[CaptureSourceSpec],
    name: &str,
    config_text: Option<&str>,
    flags: AddImageFlags,
    progress: Option<&mut dyn FnMut(&ProgressEvent<'_>)>,
) -> Result<()> {
    if flags.contains(AddImageFlags::NTFS) {
        if flags.contains(AddImageFlags::DEREFERENCE) {
            error!("cannot dereference files when capturing directly from NTFS");
            return Err(Error::InvalidParam(
                "NTFS capture cannot dereference symbolic links",
            ));
        }
        if flags.contains(AddImageFlags::UNIX_DATA) {
            error!("capturing UNIX owner and mode is not supported when capturing from NTFS");
            return Err(Error::InvalidParam("NTFS capture cannot record UNIX data"));
        }
        error!("no NTFS volume capture backend is available here");
        return Err(Error::Unsupported(
            "NTFS volume capture requires an NTFS-aware capture source",
        ));
    }
    let mut src = PosixSource::new(flags.contains(AddImageFlags::DEREFERENCE));
    add_image_multisource_from(wim, &mut src, sources, name, config_text, flags, progress)
}

/// Captures a new image from a single source directory (or file) placed at
/// the image root.
pub fn add_image(
    wim: &mut Wim,
    source: &Path,
    name: &str,
    config_text: Option<&str>,
    flags: AddImageFlags,
    progress: Option<&mut dyn FnMut(&ProgressEvent<'_>)>,
) -> Result<()> {
    if source.as_os_str().is_empty() {
        return Err(Error::InvalidParam("source path must not be empty"));
    }
    let spec = CaptureSourceSpec {
        fs_source_path: source.to_owned(),
        wim_target_path: String::new(),
    };
    add_image_multisource(wim, &[spec], name, config_text, flags, progress)
}
