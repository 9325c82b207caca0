//! Cached, lazily expanded view of the remote directory tree.
//!
//! The server snapshot is replaced wholesale on every load. Expansion flags are
//! the only client-side state and live in a path-keyed map that is re-applied
//! to each new snapshot.

use std::collections::BTreeMap;

use crate::error::{Result, SessionError};
use crate::model::{EntryKind, FileNode};

/// Joins a remote directory and an entry name with `/`.
pub fn join_remote_path(base: &str, name: &str) -> String {
    let base = base.trim();
    let name = name.trim();
    if name.is_empty() {
        return base.to_string();
    }
    if name.starts_with('/') {
        return name.to_string();
    }
    if base.is_empty() || base == "." {
        return name.to_string();
    }
    if base == "/" {
        return format!("/{name}");
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

pub fn parent_remote_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

/// Last path component.
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// True if `path` is `base` itself or lies below it, compared by component.
pub fn path_is_within(path: &str, base: &str) -> bool {
    let base = base.trim_end_matches('/');
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Rewrites `path` from under `old_base` to under `new_base`.
pub fn replace_path_prefix(path: &str, old_base: &str, new_base: &str) -> Option<String> {
    if !path_is_within(path, old_base) {
        return None;
    }
    let rest = &path[old_base.trim_end_matches('/').len()..];
    Some(format!("{}{}", new_base.trim_end_matches('/'), rest))
}

fn validate_entry_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SessionError::validation("Name is required"));
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(SessionError::validation(format!("Invalid name: {name}")));
    }
    Ok(name)
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreeNode {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub extension: Option<String>,
    /// `None` until the server has sent this directory's entries.
    pub children: Option<Vec<TreeNode>>,
    pub expanded: bool,
}

impl TreeNode {
    fn from_snapshot(node: FileNode, flags: &BTreeMap<String, bool>) -> Self {
        let expanded = flags.get(&node.path).copied().unwrap_or(false);
        let children = match node.kind {
            EntryKind::Directory => node.children.map(|children| {
                children
                    .into_iter()
                    .map(|c| TreeNode::from_snapshot(c, flags))
                    .collect()
            }),
            EntryKind::File => None,
        };
        let extension = match node.kind {
            EntryKind::File => node.extension,
            EntryKind::Directory => None,
        };
        Self {
            name: if node.name.is_empty() {
                remote_file_name(&node.path).to_string()
            } else {
                node.name
            },
            path: node.path,
            kind: node.kind,
            extension,
            children,
            expanded,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        if self.path == path {
            return Some(self);
        }
        if !path_is_within(path, &self.path) {
            return None;
        }
        self.children
            .as_deref()?
            .iter()
            .find_map(|child| child.find(path))
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut TreeNode> {
        if self.path == path {
            return Some(self);
        }
        if !path_is_within(path, &self.path) {
            return None;
        }
        self.children
            .as_deref_mut()?
            .iter_mut()
            .find_map(|child| child.find_mut(path))
    }

    fn collect_visible(&self, depth: usize, rows: &mut Vec<VisibleRow>) {
        for child in self.children.as_deref().unwrap_or_default() {
            rows.push(VisibleRow {
                path: child.path.clone(),
                name: child.name.clone(),
                kind: child.kind,
                depth,
                expanded: child.expanded,
            });
            if child.is_dir() && child.expanded {
                child.collect_visible(depth + 1, rows);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisibleRow {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub depth: usize,
    pub expanded: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleEffect {
    Expanded,
    Collapsed,
    /// Expanded, but the subtree has not been fetched yet; a reload is due.
    NeedsLoad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadApplied {
    Applied,
    /// A newer load was issued; this result was discarded.
    Superseded,
    Failed,
}

/// A structural change the user asked for, validated and resolved to paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeChange {
    Created { path: String, kind: EntryKind },
    Renamed { old_path: String, new_path: String },
    Deleted { path: String },
}

#[derive(Debug)]
pub struct FileTree {
    root_path: String,
    root: Option<TreeNode>,
    expanded: BTreeMap<String, bool>,
    latest_load: u64,
    in_flight: bool,
    last_error: Option<String>,
}

impl FileTree {
    pub fn new(root_path: impl Into<String>, expanded: BTreeMap<String, bool>) -> Self {
        Self {
            root_path: root_path.into(),
            root: None,
            expanded,
            latest_load: 0,
            in_flight: false,
            last_error: None,
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.root.as_ref()
    }

    pub fn expansion_flags(&self) -> &BTreeMap<String, bool> {
        &self.expanded
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        self.root.as_ref()?.find(path)
    }

    pub fn is_expanded(&self, path: &str) -> bool {
        self.expanded.get(path).copied().unwrap_or(false)
    }

    /// Marks a new load as the only one whose result will be applied and
    /// returns its sequence number.
    pub fn begin_load(&mut self) -> u64 {
        self.latest_load += 1;
        self.in_flight = true;
        self.latest_load
    }

    pub fn apply_load(&mut self, seq: u64, result: std::result::Result<FileNode, String>) -> LoadApplied {
        if seq != self.latest_load {
            tracing::debug!(seq, latest = self.latest_load, "discarding superseded tree snapshot");
            return LoadApplied::Superseded;
        }
        self.in_flight = false;
        match result {
            Ok(snapshot) => {
                let mut root = TreeNode::from_snapshot(snapshot, &self.expanded);
                root.expanded = true;
                self.root = Some(root);
                self.last_error = None;
                LoadApplied::Applied
            }
            Err(message) => {
                tracing::warn!(%message, "tree load failed, keeping previous snapshot");
                self.last_error = Some(message);
                LoadApplied::Failed
            }
        }
    }

    pub fn toggle(&mut self, path: &str) -> Result<ToggleEffect> {
        let root = self
            .root
            .as_mut()
            .ok_or_else(|| SessionError::validation("File tree is not loaded"))?;
        let node = root
            .find_mut(path)
            .ok_or_else(|| SessionError::validation(format!("No such entry: {path}")))?;
        if !node.is_dir() {
            return Err(SessionError::validation(format!("Not a directory: {path}")));
        }
        node.expanded = !node.expanded;
        let expanded = node.expanded;
        let loaded = node.children.is_some();
        self.expanded.insert(path.to_string(), expanded);
        Ok(match (expanded, loaded) {
            (false, _) => ToggleEffect::Collapsed,
            (true, true) => ToggleEffect::Expanded,
            (true, false) => ToggleEffect::NeedsLoad,
        })
    }

    /// Rows to display, depth-first, descending only into expanded directories.
    pub fn visible_rows(&self) -> Vec<VisibleRow> {
        let mut rows = Vec::new();
        if let Some(root) = self.root.as_ref() {
            root.collect_visible(0, &mut rows);
        }
        rows
    }

    pub fn plan_create(&self, parent: &str, name: &str, kind: EntryKind) -> Result<TreeChange> {
        let name = validate_entry_name(name)?;
        Ok(TreeChange::Created {
            path: join_remote_path(parent, name),
            kind,
        })
    }

    pub fn plan_rename(&self, path: &str, new_name: &str) -> Result<TreeChange> {
        let new_name = validate_entry_name(new_name)?;
        if path.trim().is_empty() || path == "/" {
            return Err(SessionError::validation("Path is required"));
        }
        let new_path = join_remote_path(&parent_remote_path(path), new_name);
        if new_path == path {
            return Err(SessionError::validation("Name is unchanged"));
        }
        Ok(TreeChange::Renamed {
            old_path: path.to_string(),
            new_path,
        })
    }

    pub fn plan_delete(&self, path: &str) -> Result<TreeChange> {
        if path.trim().is_empty() || path == "/" || path == self.root_path {
            return Err(SessionError::validation("Refusing to delete the workspace root"));
        }
        Ok(TreeChange::Deleted {
            path: path.to_string(),
        })
    }

    /// Carries expansion flags over a confirmed structural change. A reload
    /// must follow.
    pub fn apply_change(&mut self, change: &TreeChange) {
        match change {
            TreeChange::Renamed { old_path, new_path } => {
                let moved: Vec<(String, bool)> = self
                    .expanded
                    .iter()
                    .filter_map(|(path, flag)| {
                        replace_path_prefix(path, old_path, new_path).map(|p| (p, *flag))
                    })
                    .collect();
                self.expanded.retain(|path, _| !path_is_within(path, old_path));
                self.expanded.extend(moved);
            }
            TreeChange::Deleted { path } => {
                self.expanded.retain(|p, _| !path_is_within(p, path));
            }
            TreeChange::Created { .. } => {}
        }
    }

    pub fn reset(&mut self) {
        self.root = None;
        self.in_flight = false;
        self.last_error = None;
        // Results of loads issued before the reset must not land.
        self.latest_load += 1;
    }
}
