//! Filesystem walking and node drafting.

use crate::catalog::Catalog;
use crate::error::Error;
use crate::node::{NodeDraft, NodeKind};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One entry produced by a walk.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Node metadata, without id.
    pub draft: NodeDraft,
    /// Where the entry lives on disk.
    pub source: PathBuf,
    /// Index of the enclosing directory within the same walk.
    pub parent: Option<usize>,
    /// `(dev, ino)` of a regular file with more than one link.
    pub link_key: Option<(u64, u64)>,
}

/// Result of walking one root path.
#[derive(Debug, Default)]
pub struct Walk {
    /// Entries in preorder, root first.
    pub entries: Vec<WalkEntry>,
    /// Entries that were skipped, as SourceNotFound errors.
    pub notices: Vec<Error>,
}

/// Walks filesystem trees into node drafts.
///
/// A walker remembers the inodes of multiply-linked files it has seen, so
/// later links to the same file across all of its walks become Hardlink
/// entries instead of second copies. Walks must be added to the catalog
/// through [`Walker::append`], in the order they were taken, for the links
/// to find their owner.
#[derive(Debug, Default)]
pub struct Walker {
    seen: HashSet<(u64, u64)>,
    /// Catalog id of the File that owns each multiply-linked inode.
    owners: HashMap<(u64, u64), u64>,
}

impl Walker {
    /// Create a new walker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the walked entries to a catalog under `parent_id`.
    ///
    /// Each Hardlink gets the id of the File it shares data with. A link
    /// whose owner never reached the catalog is stored as a File itself.
    /// Returns the assigned id and source path of every appended entry.
    pub fn append(
        &mut self,
        walk: Walk,
        catalog: &mut Catalog,
        parent_id: u64,
    ) -> Vec<(u64, PathBuf)> {
        let mut ids: Vec<u64> = Vec::with_capacity(walk.entries.len());
        let mut sources = Vec::with_capacity(walk.entries.len());

        for entry in walk.entries {
            let parent = entry.parent.map_or(parent_id, |index| ids[index]);
            let mut draft = entry.draft;

            if let Some(key) = entry.link_key {
                match (draft.kind, self.owners.get(&key)) {
                    (NodeKind::Hardlink, Some(&owner)) => draft.link_id = owner,
                    (NodeKind::Hardlink, None) => {
                        debug!(path = %entry.source.display(), "hard link owner missing, storing data");
                        draft.kind = NodeKind::File;
                    }
                    _ => {}
                }
            }

            let kind = draft.kind;
            let id = catalog.append(draft, parent).id;
            if let (NodeKind::File, Some(key)) = (kind, entry.link_key) {
                self.owners.entry(key).or_insert(id);
            }

            ids.push(id);
            sources.push((id, entry.source));
        }

        sources
    }

    /// Walk `root` in preorder, depth first, siblings sorted by name.
    ///
    /// Symlinks are recorded, never followed. An entry that cannot be
    /// inspected is skipped with a notice; the walk carries on.
    pub fn walk(&mut self, root: &Path) -> Walk {
        let mut walk = Walk::default();

        let metadata = match fs::symlink_metadata(root) {
            Ok(m) => m,
            Err(e) => {
                walk.skip(Error::source_not_found(root, e.to_string()));
                return walk;
            }
        };

        let Some(name) = root_name(root) else {
            walk.skip(Error::source_not_found(
                root,
                "path has no usable final component",
            ));
            return walk;
        };

        match self.draft(name, &metadata, root) {
            Ok(draft) => walk.entries.push(WalkEntry {
                draft,
                source: root.to_path_buf(),
                parent: None,
                link_key: link_key(&metadata),
            }),
            Err(e) => {
                walk.skip(e);
                return walk;
            }
        }

        if metadata.is_dir() {
            self.walk_children(root, &mut walk);
        }

        debug!(root = %root.display(), entries = walk.entries.len(), "walked");
        walk
    }

    fn walk_children(&mut self, root: &Path, walk: &mut Walk) {
        // An archiver must not drop files, so all ignore-file filtering is off.
        let walker = ignore::WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        // stack[d] is the entry index of the open directory at depth d
        let mut stack: Vec<usize> = vec![0];

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    walk.skip(Error::source_not_found(root, e.to_string()));
                    continue;
                }
            };

            let depth = entry.depth();
            if depth == 0 {
                continue;
            }

            stack.truncate(depth);
            if stack.len() != depth {
                // Enclosing directory was skipped
                debug!(path = %entry.path().display(), "skipping orphaned entry");
                continue;
            }
            let parent = stack[depth - 1];

            let path = entry.path();
            let metadata = match fs::symlink_metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    walk.skip(Error::source_not_found(path, e.to_string()));
                    continue;
                }
            };

            let Some(name) = entry.file_name().to_str() else {
                walk.skip(Error::source_not_found(path, "file name is not valid UTF-8"));
                continue;
            };

            let draft = match self.draft(name.to_string(), &metadata, path) {
                Ok(draft) => draft,
                Err(e) => {
                    walk.skip(e);
                    continue;
                }
            };

            let is_dir = draft.kind == NodeKind::Directory;
            walk.entries.push(WalkEntry {
                draft,
                source: path.to_path_buf(),
                parent: Some(parent),
                link_key: link_key(&metadata),
            });

            if is_dir {
                stack.push(walk.entries.len() - 1);
            }
        }
    }

    /// Build a draft from link-aware metadata.
    fn draft(
        &mut self,
        name: String,
        metadata: &fs::Metadata,
        path: &Path,
    ) -> Result<NodeDraft, Error> {
        let kind = self.classify(metadata);

        let mut draft = NodeDraft::new(name, kind);
        fill_metadata(&mut draft, metadata);

        if kind == NodeKind::Symlink {
            let target = fs::read_link(path)
                .map_err(|e| Error::source_not_found(path, e.to_string()))?;
            let target = target.to_str().ok_or_else(|| {
                Error::source_not_found(path, "link target is not valid UTF-8")
            })?;
            draft.link_target = Some(target.to_string());
        }

        debug!(path = %path.display(), kind = kind.as_str(), "drafted entry");
        Ok(draft)
    }

    fn classify(&mut self, metadata: &fs::Metadata) -> NodeKind {
        let file_type = metadata.file_type();
        if file_type.is_dir() {
            NodeKind::Directory
        } else if file_type.is_symlink() {
            NodeKind::Symlink
        } else if file_type.is_file() {
            if self.is_repeat_link(metadata) {
                NodeKind::Hardlink
            } else {
                NodeKind::File
            }
        } else {
            // fifos, sockets, devices: no payload to store
            NodeKind::Hardlink
        }
    }

    /// Whether this file is another name for a file already walked.
    fn is_repeat_link(&mut self, metadata: &fs::Metadata) -> bool {
        link_key(metadata).is_some_and(|key| !self.seen.insert(key))
    }
}

impl Walk {
    fn skip(&mut self, notice: Error) {
        warn!("{}", notice);
        self.notices.push(notice);
    }
}

/// Identity of a regular file that has other names.
#[cfg(unix)]
fn link_key(metadata: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (metadata.file_type().is_file() && metadata.nlink() > 1)
        .then(|| (metadata.dev(), metadata.ino()))
}

/// Hard links are not detected on non-unix platforms.
#[cfg(not(unix))]
fn link_key(_metadata: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// Walk a single root with a fresh walker.
pub fn walk(root: &Path) -> Walk {
    Walker::new().walk(root)
}

/// Base name used for a root entry.
pub(crate) fn root_name(root: &Path) -> Option<String> {
    let name = match root.file_name() {
        Some(name) => name.to_owned(),
        // `.`, `..` and friends: name the directory they resolve to
        None => fs::canonicalize(root).ok()?.file_name()?.to_owned(),
    };
    name.into_string().ok()
}

/// Copy ownership, permission and time fields from metadata.
#[cfg(unix)]
fn fill_metadata(draft: &mut NodeDraft, metadata: &fs::Metadata) {
    use std::os::unix::fs::MetadataExt;
    draft.mode = metadata.mode();
    draft.uid = metadata.uid();
    draft.gid = metadata.gid();
    draft.mtime = metadata.mtime();
    draft.atime = metadata.atime();
    draft.ctime = metadata.ctime();
    draft.size = metadata.len();
    draft.inode = metadata.ino();
}

/// Copy the fields available without POSIX metadata (Windows fallback).
#[cfg(not(unix))]
fn fill_metadata(draft: &mut NodeDraft, metadata: &fs::Metadata) {
    fn seconds(time: std::io::Result<std::time::SystemTime>) -> i64 {
        time.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64)
    }

    draft.mode = match (draft.kind, metadata.permissions().readonly()) {
        (NodeKind::Directory, _) => 0o040755,
        (_, true) => 0o100444,
        (_, false) => 0o100644,
    };
    draft.mtime = seconds(metadata.modified());
    draft.atime = seconds(metadata.accessed());
    draft.ctime = seconds(metadata.created());
    draft.size = metadata.len();
}
