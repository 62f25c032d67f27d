//! Read-only views of an archive: hierarchy listing and metadata dumps.

use crate::archive::{Archive, Report};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::node::{Node, NodeKind};
use chrono::DateTime;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use tracing::warn;

/// A node together with its position in the tree.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    /// Full archive path.
    pub path: String,
    /// Number of ancestors (roots are at 0).
    pub depth: usize,
    #[serde(flatten)]
    pub node: Node,
    /// Archive path of the File whose data a Hardlink shares.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_owner: Option<String>,
}

impl Archive {
    /// Entries of the selected subtrees (all entries when `selected` is
    /// empty), each subtree in depth-first order following `parent_id` links.
    pub fn entries<S: AsRef<str>>(&self, selected: &[S]) -> Result<(Vec<Entry>, Report)> {
        let catalog = self.catalog()?;
        let mut report = Report::default();

        let starts: Vec<u64> = if selected.is_empty() {
            catalog.roots().map(|n| n.id).collect()
        } else {
            selected
                .iter()
                .filter_map(|path| {
                    let path = path.as_ref();
                    let found = catalog.find_by_path(path).map(|n| n.id);
                    if found.is_none() {
                        let notice = Error::not_found(path);
                        warn!("{}", notice);
                        report.notices.push(notice);
                    }
                    found
                })
                .collect()
        };

        let entries = collect_entries(&catalog, &starts);
        report.entries = entries.len();
        Ok((entries, report))
    }

    /// Print the tree, indented two spaces per level.
    ///
    /// Directories end in `/`, symlinks show `-> target` and hardlinks
    /// `=> owner`.
    pub fn list_hierarchy<S: AsRef<str>, W: Write>(
        &self,
        selected: &[S],
        mut out: W,
    ) -> Result<Report> {
        let (entries, report) = self.entries(selected)?;

        for entry in &entries {
            let indent = "  ".repeat(entry.depth);
            let node = &entry.node;
            match node.kind {
                NodeKind::Directory => writeln!(out, "{}{}/", indent, node.name)?,
                NodeKind::File => writeln!(out, "{}{}", indent, node.name)?,
                NodeKind::Symlink => writeln!(
                    out,
                    "{}{} -> {}",
                    indent,
                    node.name,
                    node.link_target.as_deref().unwrap_or_default()
                )?,
                NodeKind::Hardlink => match &entry.link_owner {
                    Some(owner) => writeln!(out, "{}{} => {}", indent, node.name, owner)?,
                    None => writeln!(out, "{}{}", indent, node.name)?,
                },
            }
        }

        out.flush()?;
        Ok(report)
    }

    /// Print every field of every selected node.
    pub fn print_metadata<S: AsRef<str>, W: Write>(
        &self,
        selected: &[S],
        mut out: W,
    ) -> Result<Report> {
        let (entries, report) = self.entries(selected)?;

        for entry in &entries {
            let node = &entry.node;
            writeln!(out, "{}", entry.path)?;
            writeln!(out, "  id:          {}", node.id)?;
            writeln!(out, "  parent_id:   {}", node.parent_id)?;
            writeln!(out, "  kind:        {}", node.kind.as_str())?;
            writeln!(out, "  mode:        {:o}", node.mode)?;
            writeln!(out, "  uid:         {}", node.uid)?;
            writeln!(out, "  gid:         {}", node.gid)?;
            writeln!(out, "  mtime:       {}", timestamp(node.mtime))?;
            writeln!(out, "  atime:       {}", timestamp(node.atime))?;
            writeln!(out, "  ctime:       {}", timestamp(node.ctime))?;
            writeln!(out, "  size:        {}", node.size)?;
            writeln!(out, "  data_offset: {}", node.data_offset)?;
            writeln!(out, "  data_length: {}", node.data_length)?;
            writeln!(out, "  compressed:  {}", node.compressed)?;
            writeln!(out, "  inode:       {}", node.inode)?;
            if let Some(target) = &node.link_target {
                writeln!(out, "  link_target: {}", target)?;
            }
            if node.kind == NodeKind::Hardlink {
                writeln!(out, "  link_id:     {}", node.link_id)?;
            }
            if let Some(owner) = &entry.link_owner {
                writeln!(out, "  link_owner:  {}", owner)?;
            }
        }

        out.flush()?;
        Ok(report)
    }
}

/// Walk each start node's subtree depth-first, children in stored order.
fn collect_entries(catalog: &Catalog, starts: &[u64]) -> Vec<Entry> {
    let paths = catalog.paths();
    let children = catalog.child_index();
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for &start in starts {
        let Some(depth) = catalog.depth_of(start) else {
            continue;
        };
        let mut stack: Vec<(u64, usize)> = vec![(start, depth)];

        while let Some((id, depth)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = catalog.find_by_id(id) else {
                continue;
            };

            entries.push(entry_for(catalog, &paths, node, depth));

            if let Some(kids) = children.get(&id) {
                stack.extend(kids.iter().rev().map(|&kid| (kid, depth + 1)));
            }
        }
    }

    entries
}

fn entry_for(catalog: &Catalog, paths: &HashMap<u64, String>, node: &Node, depth: usize) -> Entry {
    let link_owner = catalog
        .hardlink_target(node)
        .and_then(|owner| paths.get(&owner.id).cloned());

    Entry {
        path: paths.get(&node.id).cloned().unwrap_or_else(|| node.name.clone()),
        depth,
        node: node.clone(),
        link_owner,
    }
}

/// Seconds since the epoch, with the RFC 3339 form when representable.
fn timestamp(secs: i64) -> String {
    match DateTime::from_timestamp(secs, 0) {
        Some(time) => format!("{} ({})", secs, time.to_rfc3339()),
        None => secs.to_string(),
    }
}
