//! Archive handle and the operations that write archives.

use crate::catalog::{Catalog, is_within, normalize_path};
use crate::codec::{self, ArchiveOptions, Sources};
use crate::error::{Error, Result};
use crate::node::NodeKind;
use crate::walk::{Walker, root_name};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of an operation that completed.
#[derive(Debug, Default)]
pub struct Report {
    /// Entries created, added, removed or restored, depending on the operation.
    pub entries: usize,
    /// Per-path problems that were skipped (never fatal errors).
    pub notices: Vec<Error>,
}

impl Report {
    fn notice(&mut self, notice: Error) {
        warn!("{}", notice);
        self.notices.push(notice);
    }

    fn absorb(&mut self, notices: Vec<Error>) {
        // Already logged by the walker
        self.notices.extend(notices);
    }
}

/// A single-file archive at a filesystem path.
///
/// Operations are synchronous and take no locks: callers must not run two
/// operations against the same archive path at once.
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    options: ArchiveOptions,
}

impl Archive {
    /// Create a handle for the archive at `path`. Nothing is read or written.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options: ArchiveOptions::default(),
        }
    }

    /// Set the options used when writing.
    pub fn with_options(mut self, options: ArchiveOptions) -> Self {
        self.options = options;
        self
    }

    /// Get the archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the write options.
    pub fn options(&self) -> ArchiveOptions {
        self.options
    }

    /// Open the archive file for reading.
    pub(crate) fn open_file(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| Error::path_io(&self.path, e))
    }

    /// Decode the archive's catalog.
    pub fn catalog(&self) -> Result<Catalog> {
        let file = self.open_file()?;
        codec::decode(&file)
    }

    /// Create (or replace) the archive from the given files and directories.
    ///
    /// Each root path becomes a root entry named by its base name. A root
    /// whose name is already taken by an earlier root is skipped as a
    /// duplicate.
    pub fn create<P: AsRef<Path>>(&self, roots: &[P]) -> Result<Report> {
        let mut report = Report::default();
        let mut catalog = Catalog::new();
        let mut sources = Sources::new();
        let mut walker = Walker::new();

        for root in roots {
            let root = root.as_ref();
            let taken = root_name(root).filter(|name| catalog.roots().any(|n| &n.name == name));
            if let Some(name) = taken {
                report.notice(Error::duplicate_entry(name));
                continue;
            }

            let mut walk = walker.walk(root);
            report.absorb(std::mem::take(&mut walk.notices));
            sources.extend(walker.append(walk, &mut catalog, 0));
        }

        report.entries = catalog.len();
        self.write_atomic(&mut catalog, &mut sources)?;

        info!(
            archive = %self.path.display(),
            entries = report.entries,
            compressed = self.options.compress,
            "created archive"
        );
        Ok(report)
    }

    /// Add files and directories to an existing archive.
    ///
    /// A path whose parent is already a directory in the archive is added
    /// beneath it (`proj/c.txt` lands inside `proj`); any other path becomes
    /// a new root. Paths already present are skipped as duplicates. The
    /// whole archive is rewritten.
    pub fn append<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Report> {
        let previous = self.open_file()?;
        let mut catalog = codec::decode(&previous)?;
        let mut sources = Sources::with_previous(previous);
        let mut report = Report::default();
        let mut walker = Walker::new();
        let mut added: Vec<String> = Vec::new();
        let before = catalog.len();

        for path in paths {
            let path = path.as_ref();
            let Some((parent_id, archive_path)) = Self::placement(&catalog, path) else {
                report.notice(Error::source_not_found(
                    path,
                    "path has no usable final component",
                ));
                continue;
            };

            if catalog.find_by_path(&archive_path).is_some()
                || added.iter().any(|a| is_within(&archive_path, a))
            {
                report.notice(Error::duplicate_entry(archive_path));
                continue;
            }

            let mut walk = walker.walk(path);
            report.absorb(std::mem::take(&mut walk.notices));
            if walk.entries.is_empty() {
                continue;
            }
            sources.extend(walker.append(walk, &mut catalog, parent_id));
            added.push(archive_path);
        }

        report.entries = catalog.len() - before;
        self.write_atomic(&mut catalog, &mut sources)?;

        info!(
            archive = %self.path.display(),
            added = report.entries,
            skipped = report.notices.len(),
            "appended to archive"
        );
        Ok(report)
    }

    /// Work out where a filesystem path lands in the archive.
    ///
    /// The longest trailing run of the path's parent components that names
    /// a directory in the archive becomes the parent, so both `proj/c.txt`
    /// and `/home/me/proj/c.txt` land inside an archived `proj`. Returns the
    /// parent id (0 for a new root) and the resulting archive path.
    fn placement(catalog: &Catalog, path: &Path) -> Option<(u64, String)> {
        let name = root_name(path)?;

        let parent = path
            .to_str()
            .and_then(normalize_path)
            .and_then(|p| p.rsplit_once('/').map(|(parent, _)| parent.to_string()));

        if let Some(parent) = parent {
            let mut candidate = parent.as_str();
            loop {
                if let Some(dir) = catalog
                    .find_by_path(candidate)
                    .filter(|node| node.kind == NodeKind::Directory)
                {
                    let dir_path = catalog.path_of(dir.id)?;
                    return Some((dir.id, format!("{}/{}", dir_path, name)));
                }
                match candidate.split_once('/') {
                    Some((_, rest)) => candidate = rest,
                    None => break,
                }
            }
        }

        Some((0, name))
    }

    /// Remove entries (and everything beneath them) from the archive.
    ///
    /// Missing paths are reported and skipped. The whole archive is rewritten.
    pub fn delete<S: AsRef<str>>(&self, targets: &[S]) -> Result<Report> {
        let previous = self.open_file()?;
        let mut catalog = codec::decode(&previous)?;
        let mut report = Report::default();

        for target in targets {
            let target = target.as_ref();
            let Some(id) = catalog.find_by_path(target).map(|n| n.id) else {
                report.notice(Error::not_found(target));
                continue;
            };
            report.entries += catalog.remove_subtree(id).len();
        }

        let mut sources = Sources::with_previous(previous);
        self.write_atomic(&mut catalog, &mut sources)?;

        info!(
            archive = %self.path.display(),
            removed = report.entries,
            remaining = catalog.len(),
            "deleted from archive"
        );
        Ok(report)
    }

    /// Report whether `path` names an entry in the archive.
    pub fn query(&self, path: &str) -> Result<bool> {
        Ok(self.catalog()?.find_by_path(path).is_some())
    }

    /// Encode `catalog` into a temporary file beside the archive, then move
    /// it over the archive path.
    ///
    /// The previous archive stays intact until the new image is complete.
    /// The result keeps the previous archive's permissions; a new archive
    /// gets the usual permissions of a newly created file.
    fn write_atomic(&self, catalog: &mut Catalog, sources: &mut Sources) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let temp_file = temp_builder()
            .tempfile_in(&dir)
            .map_err(|e| Error::path_io(&dir, e))?;

        if let Ok(previous) = fs::metadata(&self.path) {
            fs::set_permissions(temp_file.path(), previous.permissions())
                .map_err(|e| Error::path_io(temp_file.path(), e))?;
        }

        {
            let mut writer = BufWriter::new(temp_file.as_file());
            codec::encode(catalog, sources, &mut writer, &self.options)?;
        }
        temp_file.as_file().sync_all()?;

        temp_file.persist(&self.path)?;
        Ok(())
    }
}

/// Temporary files are opened with mode 0666, so the umask decides the
/// permissions of a new archive just as it would for `File::create`.
#[cfg(unix)]
fn temp_builder() -> tempfile::Builder<'static, 'static> {
    use std::os::unix::fs::PermissionsExt;

    let mut builder = tempfile::Builder::new();
    builder.permissions(fs::Permissions::from_mode(0o666));
    builder
}

#[cfg(not(unix))]
fn temp_builder() -> tempfile::Builder<'static, 'static> {
    tempfile::Builder::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::node::NodeDraft;
    use tempfile::TempDir;

    /// proj/{a.txt = "hello", sub/{b.txt = "hi!"}}
    fn sample_tree(temp_dir: &TempDir) -> PathBuf {
        let proj = temp_dir.path().join("proj");
        fs::create_dir(&proj).unwrap();
        fs::write(proj.join("a.txt"), b"hello").unwrap();
        fs::create_dir(proj.join("sub")).unwrap();
        fs::write(proj.join("sub").join("b.txt"), b"hi!").unwrap();
        proj
    }

    fn names(catalog: &Catalog) -> Vec<String> {
        catalog.iter().map(|n| n.name.clone()).collect()
    }

    #[test]
    fn test_create_archive() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"));

        let report = archive.create(&[&proj]).unwrap();
        assert_eq!(report.entries, 4);
        assert!(report.notices.is_empty());

        let bytes = fs::read(archive.path()).unwrap();
        assert_eq!(&bytes[0..4], b"MYZ\0");

        let catalog = archive.catalog().unwrap();
        assert_eq!(names(&catalog), vec!["proj", "a.txt", "sub", "b.txt"]);

        let a = catalog.find_by_path("proj/a.txt").unwrap();
        assert_eq!(a.data_length, 5);
        assert!(!a.compressed);
        let b = catalog.find_by_path("proj/sub/b.txt").unwrap();
        assert_eq!(b.data_length, 3);
        assert_eq!(
            &bytes[b.data_offset as usize..(b.data_offset + b.data_length) as usize],
            b"hi!"
        );
    }

    #[test]
    fn test_create_with_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"));

        let report = archive
            .create(&[proj.clone(), temp_dir.path().join("missing")])
            .unwrap();

        assert_eq!(report.entries, 4);
        assert_eq!(report.notices.len(), 1);
        assert!(matches!(report.notices[0], Error::SourceNotFound { .. }));
    }

    #[test]
    fn test_create_multiple_roots() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let extra = temp_dir.path().join("extra.txt");
        fs::write(&extra, b"more").unwrap();

        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[proj, extra]).unwrap();

        let catalog = archive.catalog().unwrap();
        let roots: Vec<&str> = catalog.roots().map(|n| n.name.as_str()).collect();
        assert_eq!(roots, vec!["proj", "extra.txt"]);
    }

    #[test]
    fn test_create_skips_roots_with_same_name() {
        let temp_dir = TempDir::new().unwrap();
        for dir in ["a", "b"] {
            fs::create_dir_all(temp_dir.path().join(dir).join("x")).unwrap();
            fs::write(temp_dir.path().join(dir).join("x").join("f"), dir).unwrap();
        }
        let archive = Archive::new(temp_dir.path().join("test.myz"));

        let report = archive
            .create(&[temp_dir.path().join("a/x"), temp_dir.path().join("b/x")])
            .unwrap();

        assert_eq!(report.entries, 2);
        assert_eq!(report.notices.len(), 1);
        assert!(matches!(report.notices[0], Error::DuplicateEntry { .. }));

        let catalog = archive.catalog().unwrap();
        assert_eq!(catalog.roots().count(), 1);
        let f = catalog.find_by_path("x/f").unwrap();
        assert_eq!(f.size, 1);
    }

    #[test]
    fn test_append_new_file_into_directory() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[&proj]).unwrap();
        let before = archive.catalog().unwrap();
        let data_end = before
            .iter()
            .filter(|n| n.kind == NodeKind::File)
            .map(|n| n.data_offset + n.data_length)
            .max()
            .unwrap();

        fs::write(proj.join("c.txt"), b"new").unwrap();
        let report = archive.append(&[proj.join("c.txt")]).unwrap();
        assert_eq!(report.entries, 1);

        let after = archive.catalog().unwrap();
        assert_eq!(after.len(), 5);
        let c = after.find_by_path("proj/c.txt").unwrap();
        assert_eq!(c.parent_id, after.find_by_path("proj").unwrap().id);
        assert!(c.data_offset >= data_end);
    }

    #[test]
    fn test_append_duplicate_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[&proj]).unwrap();

        let report = archive.append(&[&proj]).unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(report.notices.len(), 1);
        assert!(matches!(report.notices[0], Error::DuplicateEntry { .. }));
        assert_eq!(archive.catalog().unwrap().len(), 4);

        let report = archive.append(&[proj.join("sub")]).unwrap();
        assert!(matches!(report.notices[0], Error::DuplicateEntry { .. }));
        assert_eq!(archive.catalog().unwrap().len(), 4);
    }

    #[test]
    fn test_append_overlapping_paths_in_one_call() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let other = temp_dir.path().join("other.txt");
        fs::write(&other, b"x").unwrap();

        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[&other]).unwrap();

        let report = archive.append(&[proj.clone(), proj.join("sub")]).unwrap();
        assert_eq!(report.entries, 4);
        assert_eq!(report.notices.len(), 1);
        assert!(matches!(report.notices[0], Error::DuplicateEntry { .. }));
    }

    #[test]
    fn test_append_preserves_existing_payloads() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"))
            .with_options(ArchiveOptions::default().with_compression(true));
        archive.create(&[&proj]).unwrap();

        let extra = temp_dir.path().join("plain.txt");
        fs::write(&extra, b"plain").unwrap();
        Archive::new(archive.path()).append(&[&extra]).unwrap();

        let catalog = archive.catalog().unwrap();
        assert!(catalog.find_by_path("proj/a.txt").unwrap().compressed);
        let plain = catalog.find_by_path("plain.txt").unwrap();
        assert!(!plain.compressed);
        assert_eq!(plain.data_length, 5);
    }

    #[test]
    fn test_delete_subtree() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[&proj]).unwrap();

        let report = archive.delete(&["proj/sub"]).unwrap();
        assert_eq!(report.entries, 2);

        let catalog = archive.catalog().unwrap();
        assert_eq!(names(&catalog), vec!["proj", "a.txt"]);
        assert!(!archive.query("proj/sub/b.txt").unwrap());
        assert!(!archive.query("proj/sub").unwrap());
        assert!(archive.query("proj/a.txt").unwrap());

        // Data section shrinks to the remaining payload
        let bytes = fs::read(archive.path()).unwrap();
        assert_eq!(Header::decode(&bytes).unwrap().metadata_offset, 12 + 5);
    }

    #[test]
    fn test_delete_missing_path() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[&proj]).unwrap();

        let report = archive.delete(&["proj/nope", "proj/a.txt"]).unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(report.notices.len(), 1);
        assert!(matches!(report.notices[0], Error::NotFound { .. }));
        assert_eq!(archive.catalog().unwrap().len(), 3);
    }

    #[test]
    fn test_failed_rewrite_keeps_original() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.myz");
        fs::write(&path, b"not an archive at all").unwrap();

        let archive = Archive::new(&path);
        assert!(archive.delete(&["anything"]).is_err());
        assert!(archive.append(&[temp_dir.path()]).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"not an archive at all");
    }

    /// Names in `dir`, sorted.
    fn dir_listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_failed_encode_keeps_original_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[&proj]).unwrap();
        let original = fs::read(archive.path()).unwrap();
        let listing = dir_listing(temp_dir.path());

        // A File whose source vanished fails partway through the rewrite
        let previous = archive.open_file().unwrap();
        let mut catalog = codec::decode(&previous).unwrap();
        let gone = catalog
            .append(NodeDraft::new("gone.txt", NodeKind::File), 0)
            .id;
        let mut sources = Sources::with_previous(previous);
        sources.extend(vec![(gone, temp_dir.path().join("gone.txt"))]);

        assert!(archive.write_atomic(&mut catalog, &mut sources).is_err());
        assert_eq!(fs::read(archive.path()).unwrap(), original);
        assert_eq!(dir_listing(temp_dir.path()), listing);
    }

    #[test]
    #[cfg(unix)]
    fn test_append_unreadable_source_keeps_original() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        if fs::metadata(&proj).unwrap().uid() == 0 {
            // root can open a mode 000 file
            return;
        }
        let archive = Archive::new(temp_dir.path().join("test.myz"));
        archive.create(&[&proj]).unwrap();
        let original = fs::read(archive.path()).unwrap();

        let locked = temp_dir.path().join("locked.txt");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let listing = dir_listing(temp_dir.path());

        assert!(archive.append(&[&locked]).is_err());
        assert_eq!(fs::read(archive.path()).unwrap(), original);
        assert_eq!(dir_listing(temp_dir.path()), listing);
    }

    #[test]
    #[cfg(unix)]
    fn test_rewrite_keeps_archive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let proj = sample_tree(&temp_dir);
        let path = temp_dir.path().join("test.myz");
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;

        // A new archive gets the mode of any newly created file
        let plain = temp_dir.path().join("plain");
        fs::write(&plain, b"").unwrap();
        let archive = Archive::new(&path);
        archive.create(&[&proj]).unwrap();
        assert_eq!(mode(&path), mode(&plain));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        archive.create(&[&proj]).unwrap();
        assert_eq!(mode(&path), 0o640);

        fs::write(proj.join("c.txt"), b"new").unwrap();
        archive.append(&[proj.join("c.txt")]).unwrap();
        assert_eq!(mode(&path), 0o640);

        archive.delete(&["proj/sub"]).unwrap();
        assert_eq!(mode(&path), 0o640);
    }

    #[test]
    fn test_open_missing_archive() {
        let temp_dir = TempDir::new().unwrap();
        let archive = Archive::new(temp_dir.path().join("missing.myz"));
        assert!(matches!(
            archive.query("x").unwrap_err(),
            Error::PathIo { .. }
        ));
    }
}
