//! Editor tab manager.
//!
//! Owns the insertion-ordered set of open documents, their dirty state and the
//! active tab. Reads and writes are issued by the session; this module only
//! records what is in flight and applies completions.

use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, SessionError};
use crate::file_tree::{path_is_within, remote_file_name, replace_path_prefix};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(u64);

impl TabId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tab {
    pub id: TabId,
    pub path: String,
    pub name: String,
    pub buffered_content: String,
    /// Content at the last successful load or save.
    pub clean_content: String,
    pub dirty: bool,
    /// Exact content of a write in flight, if any.
    saving: Option<String>,
}

impl Tab {
    fn recompute_dirty(&mut self) {
        self.dirty = self.buffered_content != self.clean_content;
    }

    pub fn is_saving(&self) -> bool {
        self.saving.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenAction {
    /// The path was already open; that tab is now active.
    Activated(TabId),
    /// A read must be issued.
    Fetch,
    /// A read for this path is already in flight.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    NeedsConfirmation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveRequest {
    pub tab: TabId,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct TabManager {
    tabs: Vec<Tab>,
    active: Option<TabId>,
    next_id: u64,
    pending_opens: HashSet<String>,
    awaiting_confirmation: Option<TabId>,
}

impl TabManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn get(&self, id: TabId) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == id)
    }

    pub fn find_by_path(&self, path: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.path == path)
    }

    pub fn active_id(&self) -> Option<TabId> {
        self.active
    }

    pub fn active(&self) -> Option<&Tab> {
        self.active.and_then(|id| self.get(id))
    }

    pub fn awaiting_confirmation(&self) -> Option<TabId> {
        self.awaiting_confirmation
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    fn index_of(&self, id: TabId) -> Option<usize> {
        self.tabs.iter().position(|t| t.id == id)
    }

    fn get_mut(&mut self, id: TabId) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.id == id)
    }

    fn alloc_id(&mut self) -> TabId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        TabId(self.next_id)
    }

    pub fn activate(&mut self, id: TabId) -> Result<()> {
        if self.get(id).is_none() {
            return Err(SessionError::UnknownTab(id));
        }
        self.active = Some(id);
        Ok(())
    }

    /// First half of opening a file: activates an existing tab or tells the
    /// caller whether a read has to be issued.
    pub fn open(&mut self, path: &str) -> OpenAction {
        if let Some(id) = self.find_by_path(path).map(|t| t.id) {
            self.active = Some(id);
            return OpenAction::Activated(id);
        }
        if !self.pending_opens.insert(path.to_string()) {
            return OpenAction::Pending;
        }
        OpenAction::Fetch
    }

    /// Applies a successful read. A tab that appeared for `path` meanwhile is
    /// activated instead of duplicated.
    pub fn complete_open(&mut self, path: &str, name: &str, content: String) -> TabId {
        self.pending_opens.remove(path);
        if let Some(id) = self.find_by_path(path).map(|t| t.id) {
            self.active = Some(id);
            return id;
        }
        let id = self.alloc_id();
        let name = if name.trim().is_empty() {
            remote_file_name(path).to_string()
        } else {
            name.to_string()
        };
        self.tabs.push(Tab {
            id,
            path: path.to_string(),
            name,
            clean_content: content.clone(),
            buffered_content: content,
            dirty: false,
            saving: None,
        });
        self.active = Some(id);
        tracing::debug!(%id, path, "tab opened");
        id
    }

    pub fn fail_open(&mut self, path: &str) {
        self.pending_opens.remove(path);
    }

    /// Replaces the active tab's buffer.
    pub fn edit(&mut self, content: impl Into<String>) -> Result<TabId> {
        let id = self.active.ok_or(SessionError::NoActiveTab)?;
        let tab = self.get_mut(id).ok_or(SessionError::UnknownTab(id))?;
        tab.buffered_content = content.into();
        tab.recompute_dirty();
        Ok(id)
    }

    /// Snapshots the active tab's buffer for writing.
    pub fn save(&mut self) -> Result<SaveRequest> {
        let id = self.active.ok_or(SessionError::NoActiveTab)?;
        let tab = self.get_mut(id).ok_or(SessionError::UnknownTab(id))?;
        let content = tab.buffered_content.clone();
        tab.saving = Some(content.clone());
        Ok(SaveRequest {
            tab: id,
            path: tab.path.clone(),
            content,
        })
    }

    /// Applies a successful write of `written`. Returns false if the tab is gone.
    pub fn complete_save(&mut self, id: TabId, written: String) -> bool {
        let Some(tab) = self.get_mut(id) else {
            return false;
        };
        tab.saving = None;
        tab.clean_content = written;
        tab.recompute_dirty();
        true
    }

    pub fn fail_save(&mut self, id: TabId) {
        if let Some(tab) = self.get_mut(id) {
            tab.saving = None;
        }
    }

    /// Closes a clean tab immediately; a dirty one waits for
    /// [`TabManager::confirm_close`] or [`TabManager::cancel_close`].
    pub fn request_close(&mut self, id: TabId) -> Result<CloseOutcome> {
        let tab = self.get(id).ok_or(SessionError::UnknownTab(id))?;
        if tab.dirty {
            self.awaiting_confirmation = Some(id);
            return Ok(CloseOutcome::NeedsConfirmation);
        }
        self.remove(id);
        Ok(CloseOutcome::Closed)
    }

    pub fn confirm_close(&mut self, id: TabId) -> Result<()> {
        if self.get(id).is_none() {
            self.clear_confirmation(id);
            return Err(SessionError::UnknownTab(id));
        }
        self.clear_confirmation(id);
        self.remove(id);
        Ok(())
    }

    pub fn cancel_close(&mut self, id: TabId) {
        self.clear_confirmation(id);
    }

    fn clear_confirmation(&mut self, id: TabId) {
        if self.awaiting_confirmation == Some(id) {
            self.awaiting_confirmation = None;
        }
    }

    fn remove(&mut self, id: TabId) -> Option<Tab> {
        let index = self.index_of(id)?;
        let tab = self.tabs.remove(index);
        self.clear_confirmation(id);
        if self.active == Some(id) {
            self.active = if self.tabs.is_empty() {
                None
            } else {
                let fallback = index.saturating_sub(1).min(self.tabs.len() - 1);
                Some(self.tabs[fallback].id)
            };
        }
        tracing::debug!(%id, path = %tab.path, "tab closed");
        Some(tab)
    }

    /// Re-points tabs and in-flight reads at or below `old_path` to
    /// `new_path`. Buffers, dirty flags and ordering are untouched. A tab that
    /// was already open at a destination path now shows a replaced file and
    /// is dropped in favour of the moved one.
    pub fn reconcile_rename(&mut self, old_path: &str, new_path: &str) -> Vec<TabId> {
        let mut touched = Vec::new();
        for tab in self.tabs.iter_mut() {
            if let Some(path) = replace_path_prefix(&tab.path, old_path, new_path) {
                tab.name = remote_file_name(&path).to_string();
                tab.path = path;
                touched.push(tab.id);
            }
        }

        let shadowed: Vec<(TabId, TabId)> = self
            .tabs
            .iter()
            .filter(|t| !touched.contains(&t.id))
            .filter_map(|stale| {
                self.tabs
                    .iter()
                    .find(|t| touched.contains(&t.id) && t.path == stale.path)
                    .map(|moved| (stale.id, moved.id))
            })
            .collect();
        for (stale, moved) in shadowed {
            let was_active = self.active == Some(stale);
            self.remove(stale);
            if was_active {
                self.active = Some(moved);
            }
        }

        self.pending_opens = self
            .pending_opens
            .drain()
            .map(|p| replace_path_prefix(&p, old_path, new_path).unwrap_or(p))
            .collect();
        touched
    }

    /// Drops tabs at or below `path` without confirmation, and forgets reads
    /// still in flight for them.
    pub fn reconcile_delete(&mut self, path: &str) -> Vec<Tab> {
        self.pending_opens.retain(|p| !path_is_within(p, path));
        let doomed: Vec<TabId> = self
            .tabs
            .iter()
            .filter(|t| path_is_within(&t.path, path))
            .map(|t| t.id)
            .collect();
        doomed.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn is_opening(&self, path: &str) -> bool {
        self.pending_opens.contains(path)
    }

    pub fn reset(&mut self) {
        self.tabs.clear();
        self.active = None;
        self.pending_opens.clear();
        self.awaiting_confirmation = None;
    }
}
