//! Layer assembly.
//!
//! Applies layer archives bottom to top onto an empty directory, honoring
//! whiteouts (`.wh.<name>`) and opaque markers (`.wh..wh..opq`). Alongside
//! the materialized tree an index of every surviving path is kept with the
//! metadata from the archive headers; population of the disk image applies
//! ownership, modes and times from that index.
//!
//! Paths are resolved inside the root the way a chroot would: absolute
//! symlinks restart at the root and relative ones may not climb above it.
//! Anything that would land outside the root is rejected, never rewritten.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use dockboot_core::error::{ConvertError, Result};
use dockboot_core::event::Phase;
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Symlink hops allowed while resolving one path.
const MAX_SYMLINK_FOLLOWS: usize = 40;

/// What an archive entry means for the merged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: PathBuf },
    /// Target is relative to the root.
    Hardlink { target: PathBuf },
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
    Fifo,
    /// Delete `target` (a sibling of the marker) from lower layers.
    Whiteout { target: OsString },
    /// Discard lower-layer content of the marker's directory.
    Opaque,
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    pub fn is_device(&self) -> bool {
        matches!(
            self,
            EntryKind::CharDevice { .. } | EntryKind::BlockDevice { .. } | EntryKind::Fifo
        )
    }
}

/// A classified archive entry, path normalized relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Classify one archive entry.
///
/// Returns `Ok(None)` for entries that carry no tree content (the root
/// itself, PAX/GNU metadata records).
pub fn classify(
    raw_path: &Path,
    entry_type: EntryType,
    link_name: Option<&Path>,
    device: (u32, u32),
    layer: &str,
) -> Result<Option<Classified>> {
    let path = normalize(raw_path).ok_or_else(|| ConvertError::PathTraversal {
        layer: layer.to_string(),
        path: raw_path.display().to_string(),
    })?;
    let Some(name) = path.file_name().map(|n| n.to_os_string()) else {
        return Ok(None);
    };
    let name_str = name.to_string_lossy();

    if name_str == OPAQUE_MARKER {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        return Ok(Some(Classified {
            path: dir,
            kind: EntryKind::Opaque,
        }));
    }
    if let Some(target) = name_str.strip_prefix(WHITEOUT_PREFIX) {
        if target.is_empty() || target == "." || target == ".." || target.contains('/') {
            return Err(ConvertError::PathTraversal {
                layer: layer.to_string(),
                path: raw_path.display().to_string(),
            });
        }
        return Ok(Some(Classified {
            path,
            kind: EntryKind::Whiteout {
                target: OsString::from(target),
            },
        }));
    }

    let link = || {
        link_name.map(Path::to_path_buf).ok_or_else(|| ConvertError::CorruptArchive {
            layer: layer.to_string(),
            message: format!("{} has no link target", raw_path.display()),
        })
    };

    let kind = match entry_type {
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => EntryKind::File,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink { target: link()? },
        EntryType::Link => {
            let target = link()?;
            let target = normalize(&target).ok_or_else(|| ConvertError::PathTraversal {
                layer: layer.to_string(),
                path: target.display().to_string(),
            })?;
            EntryKind::Hardlink { target }
        }
        EntryType::Char => EntryKind::CharDevice {
            major: device.0,
            minor: device.1,
        },
        EntryType::Block => EntryKind::BlockDevice {
            major: device.0,
            minor: device.1,
        },
        EntryType::Fifo => EntryKind::Fifo,
        EntryType::XGlobalHeader
        | EntryType::XHeader
        | EntryType::GNULongName
        | EntryType::GNULongLink => return Ok(None),
        other => {
            return Err(ConvertError::CorruptArchive {
                layer: layer.to_string(),
                message: format!("unsupported entry type {:?} at {}", other, raw_path.display()),
            })
        }
    };

    Ok(Some(Classified { path, kind }))
}

/// Lexically normalize an archive path; `None` if it climbs above the root.
fn normalize(raw: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Some(out)
}

/// Metadata of one path in the merged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    /// Permission bits including setuid/setgid/sticky.
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    /// Content bytes (regular files only).
    pub size: u64,
    /// False for device nodes that could not be created unprivileged.
    pub materialized: bool,
}

impl TreeEntry {
    fn implicit_dir() -> Self {
        Self {
            kind: EntryKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
            materialized: true,
        }
    }
}

/// Per-layer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub entries: usize,
    pub whiteouts: usize,
    pub bytes: u64,
}

/// The merged root filesystem.
#[derive(Debug, Clone)]
pub struct AssembledRoot {
    root: PathBuf,
    entries: BTreeMap<PathBuf, TreeEntry>,
}

impl AssembledRoot {
    /// Directory holding the materialized tree.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Entries keyed by root-relative path; parents sort before children.
    pub fn entries(&self) -> &BTreeMap<PathBuf, TreeEntry> {
        &self.entries
    }

    pub fn get(&self, rel: impl AsRef<Path>) -> Option<&TreeEntry> {
        self.entries.get(rel.as_ref())
    }

    pub fn contains(&self, rel: impl AsRef<Path>) -> bool {
        self.entries.contains_key(rel.as_ref())
    }

    /// Sum of regular file content, hardlinks counted once.
    pub fn content_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.size)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compression of a layer blob, from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    None,
}

impl Compression {
    pub fn sniff(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Applies layers in order onto an empty root.
pub struct LayerAssembler {
    root: PathBuf,
    entries: BTreeMap<PathBuf, TreeEntry>,
    privileged: bool,
    cancel: Option<CancellationToken>,
}

impl LayerAssembler {
    /// Start assembling into `root`, which must be empty or absent.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .map_err(|e| ConvertError::io(format!("creating {}", root.display()), e))?;
        let mut listing = fs::read_dir(root)
            .map_err(|e| ConvertError::io(format!("reading {}", root.display()), e))?;
        if listing.next().is_some() {
            return Err(ConvertError::Internal(format!(
                "Assembly root {} is not empty",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            entries: BTreeMap::new(),
            privileged: nix::unistd::geteuid().is_root(),
            cancel: None,
        })
    }

    /// Check `token` between entries.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Apply a layer blob stored on disk, detecting its compression.
    pub fn apply_layer_file(&mut self, label: &str, path: &Path) -> Result<LayerStats> {
        let mut file = File::open(path)
            .map_err(|e| ConvertError::io(format!("opening layer {}", path.display()), e))?;
        let mut magic = [0u8; 4];
        let n = read_prefix(&mut file, &mut magic)
            .map_err(|e| ConvertError::io(format!("reading layer {}", path.display()), e))?;
        let file = File::open(path)
            .map_err(|e| ConvertError::io(format!("opening layer {}", path.display()), e))?;

        match Compression::sniff(&magic[..n]) {
            Compression::Gzip => self.apply_layer(label, flate2::read::GzDecoder::new(file)),
            Compression::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| {
                    ConvertError::CorruptArchive {
                        layer: label.to_string(),
                        message: format!("zstd: {}", e),
                    }
                })?;
                self.apply_layer(label, decoder)
            }
            Compression::None => self.apply_layer(label, file),
        }
    }

    /// Apply one uncompressed (or already decoding) tar stream.
    ///
    /// The layer is applied completely before this returns.
    pub fn apply_layer<R: Read>(&mut self, label: &str, reader: R) -> Result<LayerStats> {
        let corrupt = |message: String| ConvertError::CorruptArchive {
            layer: label.to_string(),
            message,
        };

        let mut archive = Archive::new(reader);
        let mut stats = LayerStats::default();
        let mut written: HashSet<PathBuf> = HashSet::new();

        let entries = archive.entries().map_err(|e| corrupt(e.to_string()))?;
        for entry in entries {
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(ConvertError::Cancelled(Phase::Assemble));
                }
            }

            let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
            let raw_path = entry.path().map_err(|e| corrupt(e.to_string()))?.into_owned();
            let link_name = entry
                .link_name()
                .map_err(|e| corrupt(e.to_string()))?
                .map(|l| l.into_owned());
            let header = entry.header();
            let entry_type = header.entry_type();
            let device = if matches!(entry_type, EntryType::Char | EntryType::Block) {
                let bad_device = |e: io::Error| {
                    corrupt(format!("device number of {}: {}", raw_path.display(), e))
                };
                (
                    header.device_major().map_err(bad_device)?.unwrap_or(0),
                    header.device_minor().map_err(bad_device)?.unwrap_or(0),
                )
            } else {
                (0, 0)
            };
            let meta = HeaderMeta {
                mode: header.mode().map_err(|e| corrupt(e.to_string()))? & 0o7777,
                uid: header.uid().map_err(|e| corrupt(e.to_string()))?,
                gid: header.gid().map_err(|e| corrupt(e.to_string()))?,
                mtime: header.mtime().map_err(|e| corrupt(e.to_string()))?,
            };

            let Some(classified) =
                classify(&raw_path, entry_type, link_name.as_deref(), device, label)?
            else {
                continue;
            };
            stats.entries += 1;

            match classified.kind {
                EntryKind::Whiteout { target } => {
                    stats.whiteouts += 1;
                    let parent = classified.path.parent().unwrap_or(Path::new(""));
                    let dir = self.resolve(parent, label)?;
                    self.whiteout(&dir.join(target), &written)?;
                }
                EntryKind::Opaque => {
                    stats.whiteouts += 1;
                    let dir = self.resolve(&classified.path, label)?;
                    self.opaque(&dir, &written)?;
                }
                kind => {
                    let rel = self.resolve_entry(&classified.path, label)?;
                    let size = self.materialize(&rel, &kind, &meta, &mut entry, label)?;
                    stats.bytes += size;
                    written.insert(rel);
                }
            }
        }

        tracing::debug!(
            layer = %label,
            entries = stats.entries,
            whiteouts = stats.whiteouts,
            bytes = stats.bytes,
            "Applied layer"
        );
        Ok(stats)
    }

    /// Stop and hand back the merged tree.
    pub fn finish(self) -> AssembledRoot {
        AssembledRoot {
            root: self.root,
            entries: self.entries,
        }
    }

    /// Real location for an entry: parent resolved through symlinks, final
    /// component kept as is.
    fn resolve_entry(&self, rel: &Path, layer: &str) -> Result<PathBuf> {
        let parent = rel.parent().unwrap_or(Path::new(""));
        let name = rel.file_name().ok_or_else(|| ConvertError::CorruptArchive {
            layer: layer.to_string(),
            message: format!("entry {} has no name", rel.display()),
        })?;
        Ok(self.resolve(parent, layer)?.join(name))
    }

    /// Resolve every component of `rel` inside the root.
    fn resolve(&self, rel: &Path, layer: &str) -> Result<PathBuf> {
        resolve_beneath(&self.root, rel, layer)
    }

    /// Create `rel` from an archive entry. Returns content bytes written.
    fn materialize<R: Read>(
        &mut self,
        rel: &Path,
        kind: &EntryKind,
        meta: &HeaderMeta,
        entry: &mut R,
        layer: &str,
    ) -> Result<u64> {
        if let EntryKind::Hardlink { target } = kind {
            // Only regular files share an inode; anything else is copied.
            let source = self.resolve_entry(target, layer)?;
            if let Some(existing) = self.entries.get(&source) {
                if !matches!(
                    existing.kind,
                    EntryKind::File | EntryKind::Hardlink { .. } | EntryKind::Directory
                ) {
                    let copied = existing.kind.clone();
                    tracing::debug!(path = %rel.display(), target = %target.display(), "Hardlink to non-regular entry copied");
                    return self.materialize(rel, &copied, meta, entry, layer);
                }
            }
        }

        self.ensure_parents(rel)?;
        let dest = self.root.join(rel);
        self.clear_for(&dest, kind.is_dir())?;

        let io_err = |what: &str, e: io::Error| ConvertError::io(format!("{} {}", what, dest.display()), e);
        let mut size = 0;
        let mut materialized = true;

        match kind {
            EntryKind::Directory => {
                if !dest.is_dir() {
                    fs::create_dir(&dest).map_err(|e| io_err("creating directory", e))?;
                }
                fs::set_permissions(&dest, fs::Permissions::from_mode(meta.mode | 0o700))
                    .map_err(|e| io_err("chmod", e))?;
            }
            EntryKind::File => {
                let mut file = File::create(&dest).map_err(|e| io_err("creating", e))?;
                size = copy_content(entry, &mut file, layer, &dest)?;
                file.set_permissions(fs::Permissions::from_mode(meta.mode | 0o600))
                    .map_err(|e| io_err("chmod", e))?;
            }
            EntryKind::Symlink { target } => {
                symlink(target, &dest).map_err(|e| io_err("creating symlink", e))?;
            }
            EntryKind::Hardlink { target } => {
                let source = self.resolve_entry(target, layer)?;
                match self.entries.get(&source) {
                    Some(existing) if !existing.kind.is_dir() => {}
                    _ => {
                        return Err(ConvertError::CorruptArchive {
                            layer: layer.to_string(),
                            message: format!(
                                "hardlink {} points at missing {}",
                                rel.display(),
                                target.display()
                            ),
                        })
                    }
                }
                fs::hard_link(self.root.join(&source), &dest)
                    .map_err(|e| io_err("creating hardlink", e))?;
            }
            EntryKind::CharDevice { .. } | EntryKind::BlockDevice { .. } | EntryKind::Fifo => {
                materialized = self.make_node(&dest, kind, meta.mode)?;
            }
            EntryKind::Whiteout { .. } | EntryKind::Opaque => {}
        }

        self.entries.insert(
            rel.to_path_buf(),
            TreeEntry {
                kind: kind.clone(),
                mode: meta.mode,
                uid: meta.uid,
                gid: meta.gid,
                mtime: meta.mtime,
                size,
                materialized,
            },
        );
        Ok(size)
    }

    /// Create a device node or fifo; `false` if skipped for lack of privilege.
    fn make_node(&self, dest: &Path, kind: &EntryKind, mode: u32) -> Result<bool> {
        match make_node(dest, kind, mode) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::EPERM) if !self.privileged => {
                tracing::warn!(path = %dest.display(), "Skipping device node (unprivileged)");
                Ok(false)
            }
            Err(e) => Err(ConvertError::io(
                format!("mknod {}", dest.display()),
                io::Error::from(e),
            )),
        }
    }

    /// Create missing parent directories and index them.
    fn ensure_parents(&mut self, rel: &Path) -> Result<()> {
        let mut current = PathBuf::new();
        let Some(parent) = rel.parent() else {
            return Ok(());
        };
        for part in parent.iter() {
            current.push(part);
            let host = self.root.join(&current);
            match fs::symlink_metadata(&host) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    // A non-directory where a directory is needed gets replaced.
                    self.remove_path(&current)?;
                    fs::create_dir(&host)
                        .map_err(|e| ConvertError::io(format!("creating {}", host.display()), e))?;
                    self.entries.insert(current.clone(), TreeEntry::implicit_dir());
                }
                Err(_) => {
                    fs::create_dir(&host)
                        .map_err(|e| ConvertError::io(format!("creating {}", host.display()), e))?;
                    self.entries.insert(current.clone(), TreeEntry::implicit_dir());
                }
            }
        }
        Ok(())
    }

    /// Make room at `dest` for a new entry.
    fn clear_for(&mut self, dest: &Path, new_is_dir: bool) -> Result<()> {
        let meta = match fs::symlink_metadata(dest) {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };
        // Directory over directory merges.
        if meta.is_dir() && new_is_dir {
            return Ok(());
        }
        let rel = dest
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.remove_path(&rel)
    }

    /// Remove `rel` and its subtree from disk and the index.
    fn remove_path(&mut self, rel: &Path) -> Result<()> {
        let host = self.root.join(rel);
        let result = match fs::symlink_metadata(&host) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&host),
            Ok(_) => fs::remove_file(&host),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| ConvertError::io(format!("removing {}", host.display()), e))?;
        // Descendants sort directly after their parent.
        let doomed: Vec<PathBuf> = self
            .entries
            .range(rel.to_path_buf()..)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(rel))
            .cloned()
            .collect();
        for path in doomed {
            self.entries.remove(&path);
        }
        Ok(())
    }

    /// Delete a lower-layer path. Absent paths are a no-op.
    fn whiteout(&mut self, rel: &Path, written: &HashSet<PathBuf>) -> Result<()> {
        if written.contains(rel) {
            return Ok(());
        }
        if fs::symlink_metadata(self.root.join(rel)).is_ok() || self.entries.contains_key(rel) {
            tracing::trace!(path = %rel.display(), "Whiteout");
            self.remove_path(rel)?;
        }
        Ok(())
    }

    /// Discard everything under `dir` that this layer did not write.
    fn opaque(&mut self, dir: &Path, written: &HashSet<PathBuf>) -> Result<()> {
        // Paths written by this layer and every directory above them.
        let keep: HashSet<&Path> = written
            .iter()
            .filter(|w| w.starts_with(dir))
            .flat_map(|w| w.ancestors())
            .collect();
        let doomed: Vec<PathBuf> = self
            .entries
            .range(dir.to_path_buf()..)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(dir))
            .filter(|path| path.as_path() != dir && !keep.contains(path.as_path()))
            .cloned()
            .collect();

        let mut last_removed: Option<PathBuf> = None;
        for path in doomed {
            if last_removed.as_ref().is_some_and(|r| path.starts_with(r)) {
                continue;
            }
            self.remove_path(&path)?;
            last_removed = Some(path);
        }
        Ok(())
    }
}

/// Resolve every component of `rel` inside `root` the way the target
/// system would see it: absolute links restart at `root`, and the result
/// is root-relative with no symlinks left in it. Missing components are
/// kept as they are.
pub(crate) fn resolve_beneath(root: &Path, rel: &Path, layer: &str) -> Result<PathBuf> {
    let traversal = || ConvertError::PathTraversal {
        layer: layer.to_string(),
        path: rel.display().to_string(),
    };

    let mut resolved = PathBuf::new();
    let mut pending: VecDeque<OsString> = rel.iter().map(|c| c.to_os_string()).collect();
    let mut follows = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            if !resolved.pop() {
                return Err(traversal());
            }
            continue;
        }
        if part == "." || part.is_empty() || part == "/" {
            continue;
        }

        let candidate = resolved.join(&part);
        let host_path = root.join(&candidate);
        match fs::symlink_metadata(&host_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                follows += 1;
                if follows > MAX_SYMLINK_FOLLOWS {
                    return Err(ConvertError::CorruptArchive {
                        layer: layer.to_string(),
                        message: format!("too many levels of symlinks at {}", rel.display()),
                    });
                }
                let target = fs::read_link(&host_path).map_err(|e| {
                    ConvertError::io(format!("reading link {}", host_path.display()), e)
                })?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let mut expanded: VecDeque<OsString> =
                    target.iter().map(|c| c.to_os_string()).collect();
                expanded.extend(pending.drain(..));
                pending = expanded;
            }
            _ => resolved.push(part),
        }
    }
    Ok(resolved)
}

/// mknod for a device or fifo entry.
pub(crate) fn make_node(path: &Path, kind: &EntryKind, mode: u32) -> nix::Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let (flag, dev) = match kind {
        EntryKind::CharDevice { major, minor } => {
            (SFlag::S_IFCHR, makedev(*major as u64, *minor as u64))
        }
        EntryKind::BlockDevice { major, minor } => {
            (SFlag::S_IFBLK, makedev(*major as u64, *minor as u64))
        }
        _ => (SFlag::S_IFIFO, 0),
    };
    mknod(path, flag, Mode::from_bits_truncate(mode as libc::mode_t), dev)
}

struct HeaderMeta {
    mode: u32,
    uid: u64,
    gid: u64,
    mtime: u64,
}

/// Copy entry content, telling archive corruption apart from local write errors.
fn copy_content<R: Read>(reader: &mut R, file: &mut File, layer: &str, dest: &Path) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ConvertError::CorruptArchive {
                    layer: layer.to_string(),
                    message: format!("reading {}: {}", dest.display(), e),
                })
            }
        };
        file.write_all(&buf[..n])
            .map_err(|e| ConvertError::io(format!("writing {}", dest.display()), e))?;
        total += n as u64;
    }
    Ok(total)
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Apply `layers` (label, blob path) bottom to top onto an empty `root`.
pub fn assemble(
    root: &Path,
    layers: &[(String, PathBuf)],
    cancel: Option<CancellationToken>,
) -> Result<AssembledRoot> {
    let mut assembler = LayerAssembler::new(root)?;
    if let Some(token) = cancel {
        assembler = assembler.with_cancellation(token);
    }
    for (label, path) in layers {
        assembler.apply_layer_file(label, path)?;
    }
    let assembled = assembler.finish();
    tracing::info!(
        root = %assembled.path().display(),
        entries = assembled.len(),
        bytes = assembled.content_bytes(),
        "Assembled root filesystem"
    );
    Ok(assembled)
}
