//! Notebook & Useful-Info Store (C13) and TODO Store (C14).
//!
//! Both are per-session/per-project state that must survive a rollback: each
//! mutation is recorded in a per-session journal so `Session::rollback_to`
//! can undo everything performed after a given message index, independent of
//! the checkpoint manager's file-snapshot mechanism (see the Open Questions
//! note in the design doc — this treats the journal as authoritative for
//! notebooks and the useful-info snapshot as authoritative for that store).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Useful Info (per-session, surfaced code regions)
// ---------------------------------------------------------------------------

pub const MAX_USEFUL_INFO_ITEMS: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsefulInfoItem {
    pub id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct UsefulInfoStore {
    /// session_id -> newest-first list
    items: DashMap<String, Vec<UsefulInfoItem>>,
}

impl UsefulInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        session_id: &str,
        file_path: impl Into<String>,
        start_line: u32,
        end_line: u32,
        description: Option<String>,
    ) -> UsefulInfoItem {
        let item = UsefulInfoItem {
            id: Uuid::new_v4().to_string(),
            file_path: file_path.into(),
            start_line,
            end_line,
            description,
            created_at: Utc::now(),
        };
        let mut list = self.items.entry(session_id.to_string()).or_default();
        list.insert(0, item.clone());
        list.truncate(MAX_USEFUL_INFO_ITEMS);
        item
    }

    /// Newest-first, capped at [`MAX_USEFUL_INFO_ITEMS`].
    pub fn list(&self, session_id: &str) -> Vec<UsefulInfoItem> {
        self.items
            .get(session_id)
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Snapshot taken by the checkpoint manager at turn start.
    pub fn snapshot(&self, session_id: &str) -> Vec<UsefulInfoItem> {
        self.list(session_id)
    }

    /// Restore to a prior snapshot (checkpoint rollback).
    pub fn restore(&self, session_id: &str, snapshot: Vec<UsefulInfoItem>) {
        self.items.insert(session_id.to_string(), snapshot);
    }
}

// ---------------------------------------------------------------------------
// Notebook (per-file/folder developer notes)
// ---------------------------------------------------------------------------

pub const MAX_NOTEBOOK_ENTRIES_PER_PATH: usize = 50;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotebookEntry {
    pub id: String,
    /// Normalized path; trailing `/` marks a folder entry attaching to every
    /// file under it.
    pub path: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single notebook mutation, recorded so rollback can undo it.
#[derive(Clone, Debug)]
enum NotebookOp {
    Add { path: String, entry: NotebookEntry },
    Update { path: String, id: String, prior: NotebookEntry },
    Delete { path: String, entry: NotebookEntry },
}

#[derive(Default)]
pub struct NotebookStore {
    /// normalized path -> entries
    entries: DashMap<String, Vec<NotebookEntry>>,
    /// session_id -> ordered journal of ops, keyed by the message index they
    /// were performed at (§4.12: "reverted via their journal ... per-session
    /// list of add/update/delete operations keyed by message index").
    journal: DashMap<String, Vec<(usize, NotebookOp)>>,
}

fn normalize_path(path: &str) -> String {
    let p = path.replace('\\', "/");
    p.trim_start_matches("./").to_string()
}

impl NotebookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        session_id: &str,
        message_index: usize,
        path: &str,
        note: impl Into<String>,
    ) -> NotebookEntry {
        let path = normalize_path(path);
        let now = Utc::now();
        let entry = NotebookEntry {
            id: Uuid::new_v4().to_string(),
            path: path.clone(),
            note: note.into(),
            created_at: now,
            updated_at: now,
        };
        let mut list = self.entries.entry(path.clone()).or_default();
        list.push(entry.clone());
        if list.len() > MAX_NOTEBOOK_ENTRIES_PER_PATH {
            list.remove(0);
        }
        drop(list);
        self.journal.entry(session_id.to_string()).or_default().push((
            message_index,
            NotebookOp::Add {
                path,
                entry: entry.clone(),
            },
        ));
        entry
    }

    pub fn update(
        &self,
        session_id: &str,
        message_index: usize,
        path: &str,
        id: &str,
        note: impl Into<String>,
    ) -> Option<NotebookEntry> {
        let path = normalize_path(path);
        let mut list = self.entries.get_mut(&path)?;
        let existing = list.iter_mut().find(|e| e.id == id)?;
        let prior = existing.clone();
        existing.note = note.into();
        existing.updated_at = Utc::now();
        let updated = existing.clone();
        drop(list);
        self.journal.entry(session_id.to_string()).or_default().push((
            message_index,
            NotebookOp::Update {
                path,
                id: id.to_string(),
                prior,
            },
        ));
        Some(updated)
    }

    pub fn delete(&self, session_id: &str, message_index: usize, path: &str, id: &str) -> bool {
        let path = normalize_path(path);
        let Some(mut list) = self.entries.get_mut(&path) else {
            return false;
        };
        let Some(pos) = list.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = list.remove(pos);
        drop(list);
        self.journal.entry(session_id.to_string()).or_default().push((
            message_index,
            NotebookOp::Delete { path, entry },
        ));
        true
    }

    /// Entries attached to `file_path`: exact-path entries plus any folder
    /// entry (trailing `/`) that is a prefix of the file's path.
    pub fn for_path(&self, file_path: &str) -> Vec<NotebookEntry> {
        let file_path = normalize_path(file_path);
        let mut out = Vec::new();
        if let Some(exact) = self.entries.get(&file_path) {
            out.extend(exact.iter().cloned());
        }
        for entry in self.entries.iter() {
            let key = entry.key();
            if key.ends_with('/') && file_path.starts_with(key.as_str()) {
                out.extend(entry.value().iter().cloned());
            }
        }
        out
    }

    /// Undo every journaled op for `session_id` performed at or after
    /// `from_message_index`, in reverse order.
    pub fn rollback_after(&self, session_id: &str, from_message_index: usize) {
        let Some(mut ops) = self.journal.get_mut(session_id) else {
            return;
        };
        let mut to_undo = Vec::new();
        ops.retain(|(idx, op)| {
            if *idx >= from_message_index {
                to_undo.push(op.clone());
                false
            } else {
                true
            }
        });
        drop(ops);
        for op in to_undo.into_iter().rev() {
            match op {
                NotebookOp::Add { path, entry } => {
                    if let Some(mut list) = self.entries.get_mut(&path) {
                        list.retain(|e| e.id != entry.id);
                    }
                }
                NotebookOp::Update { path, id, prior } => {
                    if let Some(mut list) = self.entries.get_mut(&path) {
                        if let Some(e) = list.iter_mut().find(|e| e.id == id) {
                            *e = prior;
                        }
                    }
                }
                NotebookOp::Delete { path, entry } => {
                    self.entries.entry(path).or_default().push(entry);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TODO Store (C14) — per-session hierarchical list
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    Pending,
    Completed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub parent_id: Option<String>,
}

#[derive(Default)]
pub struct TodoStore {
    lists: DashMap<String, Vec<TodoItem>>,
}

impl TodoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session_id: &str, content: impl Into<String>, parent_id: Option<String>) -> TodoItem {
        let item = TodoItem {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            status: TodoStatus::Pending,
            parent_id,
        };
        self.lists.entry(session_id.to_string()).or_default().push(item.clone());
        item
    }

    pub fn set_status(&self, session_id: &str, id: &str, status: TodoStatus) -> bool {
        let Some(mut list) = self.lists.get_mut(session_id) else {
            return false;
        };
        match list.iter_mut().find(|t| t.id == id) {
            Some(item) => {
                item.status = status;
                true
            }
            None => false,
        }
    }

    /// Delete an item. Cascades to every descendant (parent_id chain).
    pub fn delete(&self, session_id: &str, id: &str) -> usize {
        let Some(mut list) = self.lists.get_mut(session_id) else {
            return 0;
        };
        let mut to_remove = std::collections::HashSet::new();
        to_remove.insert(id.to_string());
        loop {
            let before = to_remove.len();
            for item in list.iter() {
                if let Some(parent) = &item.parent_id {
                    if to_remove.contains(parent) {
                        to_remove.insert(item.id.clone());
                    }
                }
            }
            if to_remove.len() == before {
                break;
            }
        }
        let before_len = list.len();
        list.retain(|t| !to_remove.contains(&t.id));
        before_len - list.len()
    }

    pub fn list(&self, session_id: &str) -> Vec<TodoItem> {
        self.lists.get(session_id).map(|l| l.clone()).unwrap_or_default()
    }

    pub fn replace(&self, session_id: &str, items: Vec<TodoItem>) {
        self.lists.insert(session_id.to_string(), items);
    }

    /// Snapshot taken by the checkpoint manager at turn start.
    pub fn snapshot(&self, session_id: &str) -> Vec<TodoItem> {
        self.list(session_id)
    }

    /// Restore to a prior snapshot (checkpoint rollback).
    pub fn restore(&self, session_id: &str, snapshot: Vec<TodoItem>) {
        self.replace(session_id, snapshot);
    }
}

/// Date-partitioned directory for a session's persisted TODO list, per §3:
/// "Persisted under a date-partitioned directory keyed by session id."
pub fn todo_dir(state_root: &Path, date: &str, session_id: &str) -> PathBuf {
    state_root.join("todos").join(date).join(format!("{session_id}.json"))
}

fn to_json(value: &impl Serialize) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Combined binding for the `notebook` tool: the tool's schema spans both the
/// notebook (per-file notes) and useful-info (per-session surfaced regions)
/// stores, so the bound sink fans calls out to whichever store owns them.
pub struct NotebookAndUsefulInfoSink {
    pub notebook: std::sync::Arc<NotebookStore>,
    pub useful_info: std::sync::Arc<UsefulInfoStore>,
}

impl agenticlaw_tools::NotebookSink for NotebookAndUsefulInfoSink {
    fn add(&self, session_id: &str, message_index: usize, path: &str, note: &str) -> serde_json::Value {
        to_json(&self.notebook.add(session_id, message_index, path, note))
    }

    fn update(
        &self,
        session_id: &str,
        message_index: usize,
        path: &str,
        id: &str,
        note: &str,
    ) -> Option<serde_json::Value> {
        self.notebook.update(session_id, message_index, path, id, note).map(|e| to_json(&e))
    }

    fn delete(&self, session_id: &str, message_index: usize, path: &str, id: &str) -> bool {
        self.notebook.delete(session_id, message_index, path, id)
    }

    fn for_path(&self, path: &str) -> Vec<serde_json::Value> {
        self.notebook.for_path(path).iter().map(to_json).collect()
    }

    fn mark_useful(
        &self,
        session_id: &str,
        file_path: &str,
        start_line: u32,
        end_line: u32,
        description: Option<String>,
    ) -> serde_json::Value {
        to_json(&self.useful_info.add(session_id, file_path, start_line, end_line, description))
    }

    fn useful_info(&self, session_id: &str) -> Vec<serde_json::Value> {
        self.useful_info.list(session_id).iter().map(to_json).collect()
    }
}

impl agenticlaw_tools::TodoSink for TodoStore {
    fn add(&self, session_id: &str, content: &str, parent_id: Option<String>) -> serde_json::Value {
        to_json(&self.add(session_id, content, parent_id))
    }

    fn set_status(&self, session_id: &str, id: &str, status: &str) -> bool {
        let status = match status {
            "pending" => TodoStatus::Pending,
            "completed" => TodoStatus::Completed,
            _ => return false,
        };
        self.set_status(session_id, id, status)
    }

    fn delete(&self, session_id: &str, id: &str) -> usize {
        self.delete(session_id, id)
    }

    fn list(&self, session_id: &str) -> Vec<serde_json::Value> {
        self.list(session_id).iter().map(to_json).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn useful_info_caps_at_100_and_is_newest_first() {
        let store = UsefulInfoStore::new();
        for i in 0..105 {
            store.add("s1", format!("f{i}.rs"), 1, 2, None);
        }
        let list = store.list("s1");
        assert_eq!(list.len(), MAX_USEFUL_INFO_ITEMS);
        assert_eq!(list[0].file_path, "f104.rs");
    }

    #[test]
    fn notebook_folder_entry_attaches_to_nested_file() {
        let store = NotebookStore::new();
        store.add("s1", 0, "src/", "watch this directory");
        let hits = store.for_path("src/lib.rs");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn notebook_rollback_undoes_ops_after_index() {
        let store = NotebookStore::new();
        let e1 = store.add("s1", 0, "a.rs", "first");
        store.add("s1", 5, "a.rs", "second");
        assert_eq!(store.for_path("a.rs").len(), 2);

        store.rollback_after("s1", 5);

        let remaining = store.for_path("a.rs");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, e1.id);
    }

    #[test]
    fn todo_delete_cascades_to_children() {
        let store = TodoStore::new();
        let parent = store.add("s1", "parent", None);
        let child = store.add("s1", "child", Some(parent.id.clone()));
        let grandchild = store.add("s1", "grandchild", Some(child.id.clone()));

        let removed = store.delete("s1", &parent.id);
        assert_eq!(removed, 3);
        assert!(store.list("s1").is_empty());
        let _ = grandchild;
    }

    #[test]
    fn todo_cap_per_path_evicts_oldest() {
        let store = NotebookStore::new();
        for i in 0..(MAX_NOTEBOOK_ENTRIES_PER_PATH + 5) {
            store.add("s1", i, "a.rs", format!("note {i}"));
        }
        assert_eq!(store.for_path("a.rs").len(), MAX_NOTEBOOK_ENTRIES_PER_PATH);
    }

    #[test]
    fn todo_snapshot_restore_round_trips() {
        let store = TodoStore::new();
        store.add("s1", "first", None);
        let snap = store.snapshot("s1");
        store.add("s1", "second", None);
        assert_eq!(store.list("s1").len(), 2);

        store.restore("s1", snap);
        let remaining = store.list("s1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "first");
    }

    #[test]
    fn notebook_and_useful_info_sink_dispatches_to_both_stores() {
        use agenticlaw_tools::NotebookSink as _;

        let sink = NotebookAndUsefulInfoSink {
            notebook: std::sync::Arc::new(NotebookStore::new()),
            useful_info: std::sync::Arc::new(UsefulInfoStore::new()),
        };

        let added = sink.add("s1", 0, "a.rs", "careful here");
        assert_eq!(added["note"], "careful here");
        let notes = sink.for_path("a.rs");
        assert_eq!(notes.len(), 1);

        let marked = sink.mark_useful("s1", "b.rs", 1, 10, None);
        assert_eq!(marked["file_path"], "b.rs");
        let info = sink.useful_info("s1");
        assert_eq!(info.len(), 1);
    }

    #[test]
    fn todo_store_sink_set_status_rejects_unknown_status() {
        use agenticlaw_tools::TodoSink;

        let store = TodoStore::new();
        let item = store.add("s1", "write tests", None);
        assert!(!TodoSink::set_status(&store, "s1", &item.id, "bogus"));
        assert!(TodoSink::set_status(&store, "s1", &item.id, "completed"));
    }
}
