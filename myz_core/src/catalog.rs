//! In-memory node catalog for one archive operation.

use crate::error::{Error, Result};
use crate::node::{Node, NodeDraft, NodeKind};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

/// Ordered collection of nodes.
///
/// Parents always precede their children. Nodes produced by a walk are in
/// preorder; nodes added by a later append go to the tail.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    nodes: Vec<Node>,
    next_id: u64,
}

impl Catalog {
    /// Create an empty catalog. The first assigned id is 1.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            next_id: 1,
        }
    }

    /// Append a node built from `draft` under `parent_id` (0 for a root).
    pub fn append(&mut self, draft: NodeDraft, parent_id: u64) -> &Node {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.nodes.push(Node::from_draft(id, parent_id, draft));
        &self.nodes[self.nodes.len() - 1]
    }

    /// Insert a decoded node, checking the catalog invariants.
    pub(crate) fn push_decoded(&mut self, node: Node) -> Result<()> {
        if node.id == 0 {
            return Err(Error::format("Node id 0 is reserved"));
        }

        if self.find_by_id(node.id).is_some() {
            return Err(Error::format(format!("Duplicate node id {}", node.id)));
        }

        if !node.is_root() && self.find_by_id(node.parent_id).is_none() {
            return Err(Error::format(format!(
                "Node {} refers to unknown or later parent {}",
                node.id, node.parent_id
            )));
        }

        if node.kind == NodeKind::Hardlink
            && node.link_id != 0
            && !self
                .find_by_id(node.link_id)
                .is_some_and(|owner| owner.kind == NodeKind::File)
        {
            return Err(Error::format(format!(
                "Hardlink {} refers to unknown or later file {}",
                node.id, node.link_id
            )));
        }

        self.next_id = self.next_id.max(node.id.saturating_add(1));
        self.nodes.push(node);
        Ok(())
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over nodes in stored order.
    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Node> {
        self.nodes.iter_mut()
    }

    /// Find a node by id.
    pub fn find_by_id(&self, id: u64) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Find a node by its archive path (e.g. `proj/sub/b.txt`).
    pub fn find_by_path(&self, path: &str) -> Option<&Node> {
        let wanted = normalize_path(path)?;
        let paths = self.paths();
        self.nodes
            .iter()
            .find(|n| paths.get(&n.id).is_some_and(|p| *p == wanted))
    }

    /// Archive path of every node, built in one pass.
    pub fn paths(&self) -> HashMap<u64, String> {
        let mut paths: HashMap<u64, String> = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let path = match paths.get(&node.parent_id) {
                Some(parent) if !node.is_root() => format!("{}/{}", parent, node.name),
                _ => node.name.clone(),
            };
            paths.insert(node.id, path);
        }
        paths
    }

    /// Archive path of one node.
    pub fn path_of(&self, id: u64) -> Option<String> {
        let mut names = Vec::new();
        let mut node = self.find_by_id(id)?;
        loop {
            names.push(node.name.as_str());
            if node.is_root() {
                break;
            }
            if names.len() > self.nodes.len() {
                return None;
            }
            node = self.find_by_id(node.parent_id)?;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Number of ancestors between a node and its root (roots are at 0).
    pub fn depth_of(&self, id: u64) -> Option<usize> {
        let mut depth = 0;
        let mut node = self.find_by_id(id)?;
        while !node.is_root() {
            if depth >= self.nodes.len() {
                return None;
            }
            node = self.find_by_id(node.parent_id)?;
            depth += 1;
        }
        Some(depth)
    }

    /// Root nodes in stored order.
    pub fn roots(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_root())
    }

    /// Children of every node, keyed by parent id, in stored order.
    pub fn child_index(&self) -> HashMap<u64, Vec<u64>> {
        let mut index: HashMap<u64, Vec<u64>> = HashMap::new();
        for node in self.nodes.iter().filter(|n| !n.is_root()) {
            index.entry(node.parent_id).or_default().push(node.id);
        }
        index
    }

    /// Ids of a node and all of its descendants, in stored order.
    pub fn subtree_ids(&self, id: u64) -> HashSet<u64> {
        let mut ids = HashSet::new();
        if self.find_by_id(id).is_none() {
            return ids;
        }
        ids.insert(id);
        // Parents precede children, so one forward pass closes the set.
        for node in &self.nodes {
            if !node.is_root() && ids.contains(&node.parent_id) {
                ids.insert(node.id);
            }
        }
        ids
    }

    /// Remove a node and every node whose parent chain reaches it.
    ///
    /// A removed File that still backs a surviving Hardlink hands its data
    /// range over to the first such Hardlink, which becomes a File; the
    /// remaining links are pointed at it. Returns the removed nodes in
    /// stored order.
    pub fn remove_subtree(&mut self, id: u64) -> Vec<Node> {
        let ids = self.subtree_ids(id);
        if ids.is_empty() {
            return Vec::new();
        }

        let (removed, kept): (Vec<Node>, Vec<Node>) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|n| ids.contains(&n.id));
        self.nodes = kept;

        for owner in removed.iter().filter(|n| n.kind == NodeKind::File) {
            self.promote_hardlink(owner);
        }

        removed
    }

    fn promote_hardlink(&mut self, owner: &Node) {
        let Some(heir) = self
            .nodes
            .iter_mut()
            .find(|n| links_to(n, owner.id))
        else {
            return;
        };
        heir.kind = NodeKind::File;
        heir.link_id = 0;
        heir.size = owner.size;
        heir.data_offset = owner.data_offset;
        heir.data_length = owner.data_length;
        heir.compressed = owner.compressed;
        let heir_id = heir.id;

        for link in self.nodes.iter_mut().filter(|n| links_to(n, owner.id)) {
            link.link_id = heir_id;
        }
    }

    /// Resolve the File that holds the data of a Hardlink node.
    pub fn hardlink_target(&self, node: &Node) -> Option<&Node> {
        if node.kind != NodeKind::Hardlink || node.link_id == 0 {
            return None;
        }
        self.find_by_id(node.link_id)
            .filter(|owner| owner.kind == NodeKind::File)
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn links_to(node: &Node, owner: u64) -> bool {
    node.kind == NodeKind::Hardlink && node.link_id == owner
}

/// Normalize a user-supplied archive path to `a/b/c` form.
///
/// Root, `.` and empty components are dropped; `..` components make the
/// path unrepresentable and yield `None`, as does an empty result.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Whether `path` equals `ancestor` or lies beneath it, by whole components.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}
