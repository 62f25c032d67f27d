//! Rebuilding filesystem trees from an archive.

use crate::archive::{Archive, Report};
use crate::catalog::Catalog;
use crate::compress;
use crate::error::{Error, Result};
use crate::node::{Node, NodeKind};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

impl Archive {
    /// Extract entries into `dest`.
    ///
    /// With no selection every root is extracted. Otherwise each selected
    /// path is extracted (with its whole subtree when it is a directory) at
    /// its archive path below `dest`, creating the enclosing directories.
    /// Existing directories are reused; any other name collision gets a
    /// numeric suffix instead of being overwritten.
    pub fn extract<S: AsRef<str>, P: AsRef<Path>>(&self, selected: &[S], dest: P) -> Result<Report> {
        let dest = dest.as_ref();
        let archive = self.open_file()?;
        let catalog = crate::codec::decode(&archive)?;
        fs::create_dir_all(dest).map_err(|e| Error::path_io(dest, e))?;

        let mut extraction = Extraction {
            children: catalog.child_index(),
            catalog: &catalog,
            archive,
            report: Report::default(),
            written: HashMap::new(),
            visited: HashSet::new(),
            dir_modes: Vec::new(),
        };

        if selected.is_empty() {
            let roots: Vec<u64> = catalog.roots().map(|n| n.id).collect();
            for id in roots {
                extraction.restore(id, dest)?;
            }
        } else {
            for path in selected {
                let path = path.as_ref();
                let Some(node) = catalog.find_by_path(path) else {
                    extraction.report_missing(path);
                    continue;
                };
                let parent_dir = match catalog.path_of(node.parent_id) {
                    Some(parent) if !node.is_root() => dest.join(parent),
                    _ => dest.to_path_buf(),
                };
                fs::create_dir_all(&parent_dir).map_err(|e| Error::path_io(&parent_dir, e))?;
                extraction.restore(node.id, &parent_dir)?;
            }
        }

        extraction.apply_dir_modes()?;

        info!(
            archive = %self.path().display(),
            dest = %dest.display(),
            entries = extraction.report.entries,
            "extracted archive"
        );
        Ok(extraction.report)
    }
}

/// State of one extract operation.
struct Extraction<'a> {
    catalog: &'a Catalog,
    children: HashMap<u64, Vec<u64>>,
    archive: File,
    report: Report,
    /// Where each extracted File landed, for linking Hardlinks to it.
    written: HashMap<u64, PathBuf>,
    visited: HashSet<u64>,
    /// Directory permissions, applied once their contents are written.
    dir_modes: Vec<(PathBuf, u32)>,
}

impl Extraction<'_> {
    fn report_missing(&mut self, path: &str) {
        let notice = Error::not_found(path);
        warn!("{}", notice);
        self.report.notices.push(notice);
    }

    /// Restore node `id` and its subtree inside `parent_dir`.
    fn restore(&mut self, id: u64, parent_dir: &Path) -> Result<()> {
        if !self.visited.insert(id) {
            // Already restored through an enclosing selection
            return Ok(());
        }
        let catalog = self.catalog;
        let Some(node) = catalog.find_by_id(id) else {
            return Ok(());
        };

        let target = parent_dir.join(&node.name);
        match node.kind {
            NodeKind::Directory => {
                let dir = self.restore_dir(node, target)?;
                let children = self.children.get(&id).cloned().unwrap_or_default();
                for child in children {
                    self.restore(child, &dir)?;
                }
            }
            NodeKind::File => {
                let target = unique_path(target);
                self.write_payload(node, &target)?;
                set_mode(&target, node.mode)?;
                self.written.insert(node.id, target);
            }
            NodeKind::Symlink => {
                let target = unique_path(target);
                restore_symlink(node, &target)?;
            }
            NodeKind::Hardlink => {
                let target = unique_path(target);
                self.restore_hardlink(node, &target)?;
            }
        }

        self.report.entries += 1;
        Ok(())
    }

    fn restore_dir(&mut self, node: &Node, target: PathBuf) -> Result<PathBuf> {
        let dir = match fs::symlink_metadata(&target) {
            Ok(m) if m.is_dir() => target,
            Ok(_) => unique_path(target),
            Err(_) => target,
        };

        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && dir.is_dir() => {}
            Err(e) => return Err(Error::path_io(&dir, e)),
        }

        debug!(path = %dir.display(), "restored directory");
        self.dir_modes.push((dir.clone(), node.mode));
        Ok(dir)
    }

    /// Copy a File's stored bytes to `target`, decompressing when flagged.
    fn write_payload(&mut self, node: &Node, target: &Path) -> Result<()> {
        self.archive.seek(SeekFrom::Start(node.data_offset))?;
        let stored = (&self.archive).take(node.data_length);

        let file = File::create(target).map_err(|e| Error::path_io(target, e))?;
        let mut writer = BufWriter::new(file);

        let written = if node.compressed {
            compress::decompress(stored, &mut writer)?
        } else {
            compress::copy_chunked(stored, &mut writer).map_err(|e| Error::path_io(target, e))?
        };

        if written != node.size {
            return Err(Error::format(format!(
                "Entry {} restored {} bytes, expected {}",
                node.name, written, node.size
            )));
        }

        debug!(path = %target.display(), bytes = written, "restored file");
        Ok(())
    }

    fn restore_hardlink(&mut self, node: &Node, target: &Path) -> Result<()> {
        let catalog = self.catalog;
        let Some(owner) = catalog.hardlink_target(node) else {
            // Special file with no stored data: leave an empty placeholder
            File::create(target).map_err(|e| Error::path_io(target, e))?;
            debug!(path = %target.display(), "restored placeholder");
            return Ok(());
        };

        if let Some(existing) = self.written.get(&owner.id) {
            if fs::hard_link(existing, target).is_ok() {
                debug!(path = %target.display(), to = %existing.display(), "restored hard link");
                return Ok(());
            }
        }

        // Owner not extracted (or not linkable): materialize its bytes here
        self.write_payload(owner, target)?;
        set_mode(target, owner.mode)?;
        self.written.insert(owner.id, target.to_path_buf());
        Ok(())
    }

    /// Apply directory permissions deepest first, so restrictive modes do
    /// not block writing the contents.
    fn apply_dir_modes(&mut self) -> Result<()> {
        for (dir, mode) in self.dir_modes.drain(..).rev() {
            set_mode(&dir, mode)?;
        }
        Ok(())
    }
}

/// Return `path`, or the first free `stem_N.ext` variant of it.
fn unique_path(path: PathBuf) -> PathBuf {
    if fs::symlink_metadata(&path).is_err() {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u64;
    loop {
        let name = match &extension {
            Some(ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        };
        let candidate = path.with_file_name(name);
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(unix)]
fn restore_symlink(node: &Node, target: &Path) -> Result<()> {
    let link = node.link_target.as_deref().unwrap_or_default();
    std::os::unix::fs::symlink(link, target).map_err(|e| Error::path_io(target, e))?;
    debug!(path = %target.display(), link, "restored symlink");
    Ok(())
}

/// Symlinks need privileges elsewhere; store the link text as a file.
#[cfg(not(unix))]
fn restore_symlink(node: &Node, target: &Path) -> Result<()> {
    let link = node.link_target.as_deref().unwrap_or_default();
    fs::write(target, link).map_err(|e| Error::path_io(target, e))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::path_io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
