//! Path names of open files, rebuilt from the dentry and mount chains.

use memflow::prelude::v1::*;

use log::*;

use crate::image::{at_offset, KernelImage};
use crate::list::container_of;

/// Name of the root dentry of a filesystem.
pub const ROOT_NAME: &str = "/";

/// Longest name of a single path component.
pub const NAME_MAX: usize = 255;

/// Every component takes at least two bytes of `PATH_MAX`, so no sane chain
/// is deeper than this.
pub const MAX_PATH_DEPTH: usize = 4096 / 2;

#[derive(Clone, Copy, Debug)]
pub struct PathOffsets {
    /// `file.f_path`
    pub f_path: usize,
    /// `path.mnt`
    pub path_mnt: usize,
    /// `path.dentry`
    pub path_dentry: usize,
    /// `mount.mnt`, the embedded `struct vfsmount`
    pub mount_mnt: usize,
    pub mnt_parent: usize,
    pub mnt_mountpoint: usize,
    pub d_parent: usize,
    pub d_name: usize,
    /// `qstr.len`
    pub qstr_len: usize,
    /// `qstr.name`
    pub qstr_name: usize,
}

impl PathOffsets {
    pub fn resolve<I: KernelImage + ?Sized>(image: &I) -> Result<Self> {
        Ok(Self {
            f_path: image.field_offset("file", "f_path")?,
            path_mnt: image.field_offset("path", "mnt")?,
            path_dentry: image.field_offset("path", "dentry")?,
            mount_mnt: image.field_offset("mount", "mnt")?,
            mnt_parent: image.field_offset("mount", "mnt_parent")?,
            mnt_mountpoint: image.field_offset("mount", "mnt_mountpoint")?,
            d_parent: image.field_offset("dentry", "d_parent")?,
            d_name: image.field_offset("dentry", "d_name")?,
            qstr_len: image.field_offset("qstr", "len")?,
            qstr_name: image.field_offset("qstr", "name")?,
        })
    }
}

/// Reads `dentry->d_name`. `None` if any part of it is unreadable.
pub fn dentry_name<I: KernelImage + ?Sized>(
    image: &mut I,
    offsets: &PathOffsets,
    dentry: Address,
) -> Option<String> {
    if dentry.is_null() {
        return None;
    }

    let qstr = at_offset(dentry, offsets.d_name);
    let len = image.read_u32(at_offset(qstr, offsets.qstr_len)).ok()? as usize;
    let name = image.read_word(at_offset(qstr, offsets.qstr_name)).ok()?;

    image.read_cstring(name, len.min(NAME_MAX)).ok()
}

/// What a walk does with the name of a node whose parent is null.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NullParent {
    /// Dentries: a null `d_parent` still names a real directory.
    Collect,
    /// Mounts: a null `mnt_parent` marks a detached mount, its mount point
    /// is not part of the path.
    Drop,
}

/// Collects names walking up a parent chain from `start`.
///
/// `step` returns the name of a node and its parent. The walk stops on an
/// absent, empty or root name (not collected) and on a null parent (the name
/// handled per `null_parent`). Otherwise the name is collected, and the walk
/// stops when the parent is the node itself or lies beyond `max_depth`.
fn walk_ancestry<I, F>(
    image: &mut I,
    start: Address,
    max_depth: usize,
    null_parent: NullParent,
    mut step: F,
) -> Vec<String>
where
    I: KernelImage + ?Sized,
    F: FnMut(&mut I, Address) -> (Option<String>, Address),
{
    let mut names = vec![];
    let mut cur = start;

    for _ in 0..max_depth {
        let (name, parent) = step(image, cur);

        let name = match name {
            Some(name) if !name.is_empty() && name != ROOT_NAME => name,
            _ => return names,
        };

        if parent.is_null() {
            if null_parent == NullParent::Collect {
                names.push(name);
            }
            return names;
        }

        names.push(name);

        if parent == cur {
            debug!("{:x} is its own parent", cur.to_umem());
            return names;
        }

        cur = parent;
    }

    warn!(
        "ancestry of {:x} is deeper than {}, chain is corrupted",
        start.to_umem(),
        max_depth
    );

    names
}

/// Names of the mount points from the mount of `vfsmount` up to the root
/// mount, innermost first.
pub fn mount_names<I: KernelImage + ?Sized>(
    image: &mut I,
    offsets: &PathOffsets,
    vfsmount: Address,
    max_depth: usize,
) -> Vec<String> {
    if vfsmount.is_null() {
        return vec![];
    }

    let offsets = *offsets;
    let mount = container_of(vfsmount, offsets.mount_mnt);

    walk_ancestry(image, mount, max_depth, NullParent::Drop, move |image, mount| {
        let name = image
            .read_word(at_offset(mount, offsets.mnt_mountpoint))
            .ok()
            .and_then(|mountpoint| dentry_name(image, &offsets, mountpoint));
        let parent = image
            .read_word(at_offset(mount, offsets.mnt_parent))
            .unwrap_or(Address::NULL);
        (name, parent)
    })
}

/// Names of `dentry` and its parents up to the filesystem root, innermost first.
pub fn dentry_names<I: KernelImage + ?Sized>(
    image: &mut I,
    offsets: &PathOffsets,
    dentry: Address,
    max_depth: usize,
) -> Vec<String> {
    let offsets = *offsets;

    walk_ancestry(image, dentry, max_depth, NullParent::Collect, move |image, dentry| {
        let name = dentry_name(image, &offsets, dentry);
        let parent = image
            .read_word(at_offset(dentry, offsets.d_parent))
            .unwrap_or(Address::NULL);
        (name, parent)
    })
}

/// Best effort absolute path of the `struct file` at `file`.
///
/// The mount point names form the prefix, the dentry names the rest. Only
/// the name of each mount point dentry is used, as the kernel's own
/// `d_path` is not reproduced here.
pub fn file_path<I: KernelImage + ?Sized>(
    image: &mut I,
    offsets: &PathOffsets,
    file: Address,
    max_depth: usize,
) -> String {
    let f_path = at_offset(file, offsets.f_path);

    let vfsmount = image
        .read_word(at_offset(f_path, offsets.path_mnt))
        .unwrap_or(Address::NULL);
    let dentry = image
        .read_word(at_offset(f_path, offsets.path_dentry))
        .unwrap_or(Address::NULL);

    let mut names = mount_names(image, offsets, vfsmount, max_depth);
    names.reverse();

    let mut in_fs = dentry_names(image, offsets, dentry, max_depth);
    in_fs.reverse();
    names.extend(in_fs);

    format!("{}{}", ROOT_NAME, names.join("/"))
}
