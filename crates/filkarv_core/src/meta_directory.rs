//! The on-disk representation of one scanned file
//!
//! Each meta-directory owns a directory under the unpack root:
//!
//! ```text
//! <unpack_root>/<name>/
//!     pathname     logical path of the file this meta-directory describes
//!     info.cbor    the persisted [`MetaDirInfo`] record
//!     rel/         children with relative logical paths
//!     abs/         children with absolute logical paths, re-rooted
//!     extracted/   carved spans, named <offset>-<size> (hex, fixed width)
//! ```
//!
//! The root meta-directory has the fixed name `root`; every other one
//! gets a fresh UUID. A meta-directory exclusively owns its subtree on
//! disk; the only cross-directory mutation is a parent recording an edge
//! to a newly created child in its own info.

use compact_str::CompactString;
use eyre::WrapErr;
use eyre::bail;
use filkarv_types::info::INFO_FILE_NAME;
use filkarv_types::info::INFO_VERSION;
use filkarv_types::ExtractedSpan;
use filkarv_types::MetaDirInfo;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

/// Fixed name of the root meta-directory.
pub const ROOT_NAME: &str = "root";

const REL_DIR: &str = "rel";
const ABS_DIR: &str = "abs";
const EXTRACTED_DIR: &str = "extracted";
const PATHNAME_FILE: &str = "pathname";

/// Handle to one meta-directory.
///
/// Loaded state lives in memory until [`Self::persist`]; the scheduler
/// persists on job close, and once an info record is marked scanned its
/// labels and metadata are never mutated again.
#[derive(Debug)]
pub struct MetaDirectory {
    unpack_root: PathBuf,
    name: CompactString,
    file_path: PathBuf,
    info: MetaDirInfo,
    dirty: bool,
}

impl MetaDirectory {
    /// Create the root meta-directory for a scan of `input`.
    ///
    /// Fails if the scan root already exists (a scan never mutates
    /// earlier results).
    pub fn create_root(unpack_root: &Path, input: &Path) -> eyre::Result<Self> {
        let dir = unpack_root.join(ROOT_NAME);
        if dir.exists() {
            bail!("Unpack directory already contains a scan root: {dir:?}");
        }
        Self::allocate(unpack_root, ROOT_NAME.into(), input.to_path_buf())
    }

    /// Create a fresh (UUID named) meta-directory for a derived file.
    ///
    /// `file_path` is the path of the file's bytes relative to the
    /// unpack root (the bytes themselves live under the producing
    /// parent's directory).
    fn create_child(unpack_root: &Path, file_path: PathBuf) -> eyre::Result<Self> {
        let name = CompactString::from(uuid::Uuid::new_v4().simple().to_string());
        Self::allocate(unpack_root, name, file_path)
    }

    fn allocate(
        unpack_root: &Path,
        name: CompactString,
        file_path: PathBuf,
    ) -> eyre::Result<Self> {
        let dir = unpack_root.join(name.as_str());
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("Failed to create meta-directory {dir:?}"))?;
        let mut pathname = File::create(dir.join(PATHNAME_FILE))
            .wrap_err_with(|| format!("Failed to create pathname record in {dir:?}"))?;
        pathname.write_all(file_path.to_string_lossy().as_bytes())?;
        let mut md = Self {
            unpack_root: unpack_root.to_path_buf(),
            name,
            file_path,
            info: MetaDirInfo::default(),
            dirty: true,
        };
        md.persist()?;
        Ok(md)
    }

    /// Open an existing meta-directory by name.
    pub fn open(unpack_root: &Path, name: &str) -> eyre::Result<Self> {
        let dir = unpack_root.join(name);
        let file_path = std::fs::read_to_string(dir.join(PATHNAME_FILE))
            .wrap_err_with(|| format!("Failed to read pathname record in {dir:?}"))?;
        let info_path = dir.join(INFO_FILE_NAME);
        let mut raw = Vec::new();
        File::open(&info_path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .wrap_err_with(|| format!("Failed to read {info_path:?}"))?;
        let info: MetaDirInfo = serde_cbor::from_slice(&raw)
            .wrap_err_with(|| format!("Failed to decode {info_path:?}"))?;
        if info.version != INFO_VERSION {
            bail!(
                "Unsupported info record version {} in {info_path:?} (expected {INFO_VERSION})",
                info.version
            );
        }
        Ok(Self {
            unpack_root: unpack_root.to_path_buf(),
            name: name.into(),
            file_path: PathBuf::from(file_path),
            info,
            dirty: false,
        })
    }

    /// Write the info record back to disk if it changed.
    pub fn persist(&mut self) -> eyre::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let path = self.dir().join(INFO_FILE_NAME);
        let encoded = serde_cbor::to_vec(&self.info)
            .wrap_err("Failed to encode info record")?;
        std::fs::write(&path, encoded)
            .wrap_err_with(|| format!("Failed to write {path:?}"))?;
        self.dirty = false;
        Ok(())
    }

    /// Name of this meta-directory under the unpack root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The logical path of the file this meta-directory describes.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Absolute path of the file's bytes on disk.
    pub fn abs_file_path(&self) -> PathBuf {
        if self.file_path.is_absolute() {
            self.file_path.clone()
        } else {
            self.unpack_root.join(&self.file_path)
        }
    }

    /// This meta-directory's own directory.
    pub fn dir(&self) -> PathBuf {
        self.unpack_root.join(self.name.as_str())
    }

    pub fn info(&self) -> &MetaDirInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut MetaDirInfo {
        self.dirty = true;
        &mut self.info
    }

    /// The relative on-disk path (under this meta-directory) a carved
    /// span is written to.
    pub fn extracted_filename(span: ExtractedSpan) -> PathBuf {
        PathBuf::from(EXTRACTED_DIR).join(span.file_name().as_str())
    }

    /// Create a child meta-directory for a regular file entry and return
    /// a writable sink for its bytes.
    pub fn unpack_regular_file(
        &mut self,
        logical: &Path,
    ) -> eyre::Result<(Self, File)> {
        let (child, full) = self.unpack_regular_file_no_open(logical)?;
        clear_stale_entry(&full)?;
        let file = File::create(&full)
            .wrap_err_with(|| format!("Failed to create unpacked file {full:?}"))?;
        Ok((child, file))
    }

    /// Like [`Self::unpack_regular_file`] but returns the path instead of
    /// an open file, for parsers that hand the destination to an
    /// external tool.
    pub fn unpack_regular_file_no_open(
        &mut self,
        logical: &Path,
    ) -> eyre::Result<(Self, PathBuf)> {
        let target = self.unpacked_target(logical)?;
        self.prepare_parent(&target.full)?;
        let child = Self::create_child(&self.unpack_root, target.root_relative)?;
        let map = if target.absolute {
            &mut self.info_mut().unpacked_absolute_files
        } else {
            &mut self.info_mut().unpacked_relative_files
        };
        map.insert(target.key, child.name.clone());
        Ok((child, target.full))
    }

    /// Record a directory entry. No child meta-directory is allocated.
    pub fn unpack_directory(&mut self, logical: &Path) -> eyre::Result<()> {
        let target = self.unpacked_target(logical)?;
        self.prepare_parent(&target.full)?;
        if !target.full.is_dir() {
            std::fs::create_dir(&target.full)
                .wrap_err_with(|| format!("Failed to create directory {:?}", target.full))?;
        }
        self.info_mut().unpacked_directories.insert(target.key);
        Ok(())
    }

    /// Record a symlink entry. The target is recorded and materialised
    /// verbatim; it is never followed during extraction.
    pub fn unpack_symlink(&mut self, logical: &Path, link_target: &Path) -> eyre::Result<()> {
        let target = self.unpacked_target(logical)?;
        self.prepare_parent(&target.full)?;
        clear_stale_entry(&target.full)?;
        std::os::unix::fs::symlink(link_target, &target.full)
            .wrap_err_with(|| format!("Failed to create symlink {:?}", target.full))?;
        self.info_mut()
            .unpacked_symlinks
            .insert(target.key, link_target.to_string_lossy().as_ref().into());
        Ok(())
    }

    /// Record a hard link entry. Materialisation is best effort (the
    /// link target may not have been unpacked); the edge is always
    /// recorded.
    pub fn unpack_hardlink(&mut self, logical: &Path, link_target: &Path) -> eyre::Result<()> {
        let target = self.unpacked_target(logical)?;
        self.info_mut()
            .unpacked_hardlinks
            .insert(target.key.clone(), link_target.to_string_lossy().as_ref().into());
        if let Ok(source) = self.unpacked_target(link_target) {
            if source.full.is_file() {
                self.prepare_parent(&target.full)?;
                clear_stale_entry(&target.full)?;
                if let Err(err) = std::fs::hard_link(&source.full, &target.full) {
                    tracing::warn!(
                        "Could not materialise hard link {:?} -> {:?}: {err}",
                        target.full,
                        source.full
                    );
                }
            }
        }
        Ok(())
    }

    /// Carve `span.size` bytes from `source` (positioned at the span
    /// start) into `extracted/` and create a child meta-directory for
    /// the carved region.
    pub fn extract_region(
        &mut self,
        source: &mut impl Read,
        span: ExtractedSpan,
    ) -> eyre::Result<Self> {
        let rel = Self::extracted_filename(span);
        let root_relative = PathBuf::from(self.name.as_str()).join(&rel);
        let full = self.unpack_root.join(&root_relative);
        self.prepare_parent(&full)?;
        let mut sink = File::create(&full)
            .wrap_err_with(|| format!("Failed to create carved file {full:?}"))?;
        let copied = std::io::copy(&mut source.take(span.size), &mut sink)
            .wrap_err_with(|| format!("Failed to carve {span} from {:?}", self.file_path))?;
        if copied != span.size {
            bail!(
                "Carved region {span} of {:?} is short: got {copied} bytes",
                self.file_path
            );
        }
        let child = Self::create_child(&self.unpack_root, root_relative)?;
        self.info_mut()
            .extracted_files
            .insert(span, child.name.clone());
        Ok(child)
    }

    /// Resolve a logical path to its location under this meta-directory.
    fn unpacked_target(&self, logical: &Path) -> eyre::Result<UnpackTarget> {
        let absolute = logical.is_absolute();
        let sanitized = sanitize_relative(logical)?;
        let subdir = if absolute { ABS_DIR } else { REL_DIR };
        let root_relative = PathBuf::from(self.name.as_str())
            .join(subdir)
            .join(&sanitized);
        let key = if absolute {
            CompactString::from(format!("/{}", sanitized.to_string_lossy()))
        } else {
            CompactString::from(sanitized.to_string_lossy().as_ref())
        };
        Ok(UnpackTarget {
            full: self.unpack_root.join(&root_relative),
            root_relative,
            key,
            absolute,
        })
    }

    /// Create all parent directories of `full`, refusing to walk through
    /// symlinks (an unpacked symlink must never redirect later entries
    /// outside the unpack root).
    fn prepare_parent(&self, full: &Path) -> eyre::Result<()> {
        let Some(parent) = full.parent() else {
            bail!("Unpack target {full:?} has no parent");
        };
        let mut current = self.dir();
        let relative = parent
            .strip_prefix(&current)
            .wrap_err_with(|| format!("Unpack target {full:?} escapes {current:?}"))?;
        for component in relative.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.is_symlink() => {
                    bail!("Refusing to unpack through symlink {current:?}");
                }
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    // A file where a directory is needed; replace it
                    std::fs::remove_file(&current)?;
                    std::fs::create_dir(&current)?;
                }
                Err(_) => {
                    std::fs::create_dir(&current).wrap_err_with(|| {
                        format!("Failed to create directory {current:?}")
                    })?;
                }
            }
        }
        Ok(())
    }
}

struct UnpackTarget {
    /// Absolute on-disk path of the entry
    full: PathBuf,
    /// The same path relative to the unpack root
    root_relative: PathBuf,
    /// Key used in the info edge maps
    key: CompactString,
    absolute: bool,
}

/// Remove whatever sits at `path` so a fresh entry can be created.
/// Needed for archives that contain the same path twice, and to make
/// sure `File::create` never follows a stale symlink.
fn clear_stale_entry(path: &Path) -> eyre::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            bail!("Unpack target {path:?} already exists as a directory");
        }
        Ok(_) => {
            std::fs::remove_file(path)
                .wrap_err_with(|| format!("Failed to replace {path:?}"))?;
        }
        Err(_) => {}
    }
    Ok(())
}

/// Normalise a logical path into a relative path that cannot escape its
/// anchor: `..` pops (never above the anchor), roots and `.` are
/// dropped.
fn sanitize_relative(path: &Path) -> eyre::Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if out.as_os_str().is_empty() {
        bail!("Logical path {path:?} resolves to nothing");
    }
    Ok(out)
}
