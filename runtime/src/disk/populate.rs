//! Copy the assembled root onto the mounted root partition.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use dockboot_core::error::{ConvertError, Result};
use dockboot_core::event::Phase;
use tokio_util::sync::CancellationToken;

use super::layout::{DiskLayout, PartitionRole};
use crate::oci::layers::{self, AssembledRoot, EntryKind, TreeEntry};

/// Mount points every bootable root needs, with their modes.
const MOUNT_POINTS: &[(&str, u32)] = &[
    ("boot", 0o755),
    ("proc", 0o555),
    ("sys", 0o555),
    ("dev", 0o755),
    ("run", 0o755),
    ("tmp", 0o1777),
];

#[derive(Debug, Clone, Default)]
pub struct PopulateOptions {
    /// Apply ownership and create device nodes.
    pub privileged: bool,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateStats {
    pub files: usize,
    pub hardlinks: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub devices: usize,
    pub skipped_devices: usize,
    pub bytes: u64,
}

/// Recreate `root` under `dest` with modes, owners and times from the index.
pub fn populate(root: &AssembledRoot, dest: &Path, options: &PopulateOptions) -> Result<PopulateStats> {
    let mut stats = PopulateStats::default();
    // (dev, ino) of the source -> first destination path
    let mut inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for (rel, entry) in root.entries() {
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(ConvertError::Cancelled(Phase::Populate));
            }
        }

        let src = root.path().join(rel);
        let dst = dest.join(rel);

        match &entry.kind {
            EntryKind::Directory => {
                if !fs::symlink_metadata(&dst).map(|m| m.is_dir()).unwrap_or(false) {
                    clear(&dst)?;
                    fs::create_dir(&dst).map_err(|e| io_err("creating", &dst, e))?;
                }
                stats.directories += 1;
            }
            EntryKind::File | EntryKind::Hardlink { .. } => {
                clear(&dst)?;
                let meta = fs::symlink_metadata(&src).map_err(|e| io_err("stat", &src, e))?;
                if !meta.file_type().is_file() {
                    return Err(ConvertError::Internal(format!(
                        "{} is indexed as a file but is not a regular file",
                        rel.display()
                    )));
                }
                let key = (meta.dev(), meta.ino());
                match inodes.get(&key) {
                    Some(first) => {
                        fs::hard_link(first, &dst).map_err(|e| io_err("linking", &dst, e))?;
                        stats.hardlinks += 1;
                        continue;
                    }
                    None => {
                        stats.bytes += copy_file(&src, &dst)?;
                        stats.files += 1;
                        inodes.insert(key, dst.clone());
                    }
                }
            }
            EntryKind::Symlink { target } => {
                clear(&dst)?;
                std::os::unix::fs::symlink(target, &dst)
                    .map_err(|e| io_err("creating symlink", &dst, e))?;
                stats.symlinks += 1;
            }
            kind @ (EntryKind::CharDevice { .. } | EntryKind::BlockDevice { .. } | EntryKind::Fifo) => {
                if !options.privileged && *kind != EntryKind::Fifo {
                    tracing::warn!(path = %rel.display(), "Skipping device node (unprivileged)");
                    stats.skipped_devices += 1;
                    continue;
                }
                clear(&dst)?;
                layers::make_node(&dst, kind, entry.mode)
                    .map_err(|e| io_err("mknod", &dst, io::Error::from(e)))?;
                stats.devices += 1;
            }
            EntryKind::Whiteout { .. } | EntryKind::Opaque => continue,
        }

        apply_metadata(&dst, entry, options.privileged)?;
    }

    // Directory modes and times last, deepest first, so writes above do not
    // bump them and read-only directories do not block their children.
    for (rel, entry) in root.entries().iter().rev() {
        if entry.kind.is_dir() {
            let dst = dest.join(rel);
            set_mode(&dst, entry.mode)?;
            set_mtime(&dst, entry.mtime)?;
        }
    }

    create_mount_points(dest)?;

    tracing::info!(
        dest = %dest.display(),
        files = stats.files,
        directories = stats.directories,
        symlinks = stats.symlinks,
        hardlinks = stats.hardlinks,
        bytes = stats.bytes,
        "Populated root filesystem"
    );
    if stats.skipped_devices > 0 {
        tracing::warn!(count = stats.skipped_devices, "Device nodes skipped");
    }
    Ok(stats)
}

fn apply_metadata(dst: &Path, entry: &TreeEntry, privileged: bool) -> Result<()> {
    if privileged {
        std::os::unix::fs::lchown(dst, Some(entry.uid as u32), Some(entry.gid as u32))
            .map_err(|e| io_err("chown", dst, e))?;
    }
    match entry.kind {
        EntryKind::Directory => Ok(()),
        EntryKind::Symlink { .. } => set_mtime(dst, entry.mtime),
        _ => {
            // chown clears setuid bits, so the mode goes after it
            set_mode(dst, entry.mode)?;
            set_mtime(dst, entry.mtime)
        }
    }
}

/// Copy a regular file without following a symlink at either end.
fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    let mut input = fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(src)
        .map_err(|e| io_err("opening", src, e))?;
    let mut output = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| io_err("creating", dst, e))?;
    io::copy(&mut input, &mut output).map_err(|e| io_err("copying", dst, e))
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err("chmod", path, e))
}

/// Set atime and mtime without following symlinks.
fn set_mtime(path: &Path, mtime: u64) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ConvertError::Internal(format!("Path contains NUL: {}", path.display())))?;
    let ts = libc::timespec {
        tv_sec: mtime as libc::time_t,
        tv_nsec: 0,
    };
    let times = [ts, ts];
    // SAFETY: c_path is a valid NUL-terminated string and times has two elements.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(io_err("setting times on", path, io::Error::last_os_error()));
    }
    Ok(())
}

/// Remove whatever non-directory sits at `path`.
fn clear(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).map_err(|e| io_err("removing", path, e))
        }
        Ok(_) => fs::remove_file(path).map_err(|e| io_err("removing", path, e)),
        Err(_) => Ok(()),
    }
}

fn create_mount_points(dest: &Path) -> Result<()> {
    for (name, mode) in MOUNT_POINTS {
        let path = dest.join(name);
        if fs::symlink_metadata(&path).is_ok() {
            continue;
        }
        fs::create_dir(&path).map_err(|e| io_err("creating", &path, e))?;
        set_mode(&path, *mode)?;
    }
    Ok(())
}

/// Write `/etc/fstab` mounting the root (and boot) partition by label.
pub fn write_fstab(dest: &Path, layout: &DiskLayout) -> Result<()> {
    let mut fstab = String::from("# <file system>\t<mount point>\t<type>\t<options>\t<dump>\t<pass>\n");
    let root = layout.root();
    fstab.push_str(&format!(
        "LABEL={}\t/\t{}\tdefaults,errors=remount-ro\t0\t1\n",
        root.label,
        root.filesystem.mount_type()
    ));
    for part in layout.partitions.iter().filter(|p| p.role == PartitionRole::Boot) {
        fstab.push_str(&format!(
            "LABEL={}\t/boot\t{}\tdefaults\t0\t2\n",
            part.label.to_ascii_uppercase(),
            part.filesystem.mount_type()
        ));
    }

    write_beneath(dest, Path::new("etc/fstab"), fstab.as_bytes())?;
    tracing::debug!(root = %dest.display(), "Wrote fstab");
    Ok(())
}

/// Label used for errors about the populated root.
const ROOT_LABEL: &str = "populated root";

/// Host path of directory `rel` inside `root`, created if missing.
///
/// Symlinks along the way resolve as they would inside the target, so the
/// result never leaves `root`. A non-directory in the way is replaced.
pub(crate) fn dir_beneath(root: &Path, rel: &Path) -> Result<PathBuf> {
    let resolved = layers::resolve_beneath(root, rel, ROOT_LABEL)?;
    let mut current = root.to_path_buf();
    for part in resolved.iter() {
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {
                tracing::warn!(path = %current.display(), "Replacing non-directory in the way");
                clear(&current)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("stat", &current, e)),
        }
        fs::create_dir(&current).map_err(|e| io_err("creating", &current, e))?;
    }
    Ok(current)
}

/// Replace file `rel` inside `root` with `contents`.
///
/// A symlink at `rel` is removed, never written through.
pub(crate) fn write_beneath(root: &Path, rel: &Path, contents: &[u8]) -> Result<PathBuf> {
    let name = rel
        .file_name()
        .ok_or_else(|| ConvertError::Internal(format!("no file name in {}", rel.display())))?;
    let parent = dir_beneath(root, rel.parent().unwrap_or(Path::new("")))?;
    let path = parent.join(name);
    clear(&path)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| io_err("creating", &path, e))?;
    io::Write::write_all(&mut file, contents).map_err(|e| io_err("writing", &path, e))?;
    Ok(path)
}

fn io_err(what: &str, path: &Path, err: io::Error) -> ConvertError {
    ConvertError::io(format!("{} {}", what, path.display()), err)
}
