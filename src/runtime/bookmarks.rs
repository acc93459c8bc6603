//! Named continuations that let external or asynchronous events resume a
//! waiting instance.
//!
//! A bookmark moves from registered to resumed exactly once. Resuming a
//! bookmark that was already consumed (or never existed) reports `NotFound`;
//! resuming one whose owner cannot run yet reports `NotReady` and leaves it
//! registered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::Value;
use crate::errors::WorkflowError;
use crate::ids::InstanceId;
use crate::runtime::work_item::{WorkItem, WorkItemKind};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bookmark {
    Named(String),
    Unnamed(u64),
    /// Routes host-async completions through the resumption path
    AsyncOperationCompletion,
}

impl Bookmark {
    pub fn named(name: impl Into<String>) -> Self {
        Bookmark::Named(name.into())
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Bookmark::Named(n) => Some(n),
            _ => None,
        }
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bookmark::Named(n) => write!(f, "{n}"),
            Bookmark::Unnamed(id) => write!(f, "#{id}"),
            Bookmark::AsyncOperationCompletion => f.write_str("<async-completion>"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkOptions {
    /// The bookmark does not keep its owner from completing
    pub non_blocking: bool,
}

impl BookmarkOptions {
    pub fn non_blocking() -> Self {
        Self { non_blocking: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkRecord {
    pub owner: InstanceId,
    pub callback: String,
    pub options: BookmarkOptions,
}

/// Outcome of a resumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkResumptionResult {
    Success,
    NotFound,
    NotReady,
}

/// Serializes maps with non-string keys as entry lists.
pub(crate) mod entries {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: DeserializeOwned + Ord,
        V: DeserializeOwned,
        D: Deserializer<'de>,
    {
        let entries: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkManager {
    #[serde(with = "entries")]
    bookmarks: BTreeMap<Bookmark, BookmarkRecord>,
    next_unnamed: u64,
}

impl BookmarkManager {
    pub(crate) fn create(
        &mut self,
        owner: InstanceId,
        name: Option<&str>,
        callback: &str,
        options: BookmarkOptions,
    ) -> Result<Bookmark, WorkflowError> {
        let bookmark = match name {
            Some(name) => {
                let bookmark = Bookmark::named(name);
                if self.bookmarks.contains_key(&bookmark) {
                    return Err(WorkflowError::invalid_operation(format!(
                        "bookmark '{name}' already exists"
                    )));
                }
                bookmark
            }
            None => {
                self.next_unnamed += 1;
                Bookmark::Unnamed(self.next_unnamed)
            }
        };
        self.bookmarks.insert(
            bookmark.clone(),
            BookmarkRecord {
                owner,
                callback: callback.to_string(),
                options,
            },
        );
        Ok(bookmark)
    }

    /// Consume a bookmark and build the work item that delivers `value`.
    ///
    /// `is_ready` decides whether the owner may run now; when it may not, the
    /// bookmark stays registered.
    pub(crate) fn try_generate_work_item(
        &mut self,
        bookmark: &Bookmark,
        value: Value,
        is_ready: impl Fn(InstanceId) -> bool,
    ) -> Result<(WorkItem, BookmarkRecord), BookmarkResumptionResult> {
        let Some(record) = self.bookmarks.get(bookmark) else {
            return Err(BookmarkResumptionResult::NotFound);
        };
        if !is_ready(record.owner) {
            return Err(BookmarkResumptionResult::NotReady);
        }
        let record = self
            .bookmarks
            .remove(bookmark)
            .ok_or(BookmarkResumptionResult::NotFound)?;
        let item = WorkItem::new(
            record.owner,
            WorkItemKind::BookmarkResumption {
                bookmark: bookmark.clone(),
                callback: record.callback.clone(),
                value,
            },
        );
        Ok((item, record))
    }

    pub fn get(&self, bookmark: &Bookmark) -> Option<&BookmarkRecord> {
        self.bookmarks.get(bookmark)
    }

    /// Remove a bookmark owned by `owner`.
    pub(crate) fn remove(&mut self, bookmark: &Bookmark, owner: InstanceId) -> Option<BookmarkRecord> {
        if self.bookmarks.get(bookmark).is_some_and(|r| r.owner == owner) {
            self.bookmarks.remove(bookmark)
        } else {
            None
        }
    }

    /// Remove every bookmark owned by `owner`.
    pub(crate) fn remove_all(&mut self, owner: InstanceId) -> Vec<(Bookmark, BookmarkRecord)> {
        let keys: Vec<Bookmark> = self
            .bookmarks
            .iter()
            .filter(|(_, r)| r.owner == owner)
            .map(|(b, _)| b.clone())
            .collect();
        keys.into_iter()
            .filter_map(|b| self.bookmarks.remove(&b).map(|r| (b, r)))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<(Bookmark, BookmarkRecord)> {
        std::mem::take(&mut self.bookmarks).into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bookmark, &BookmarkRecord)> {
        self.bookmarks.iter()
    }

    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }
}

/// Bookmarks grouped by correlation scope. Each initialized scope id is also a
/// lookup key the host associates with the workflow instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkScopeManager {
    scopes: BTreeMap<Uuid, BookmarkManager>,
    keys_to_associate: Vec<Uuid>,
    keys_to_disassociate: Vec<Uuid>,
}

impl BookmarkScopeManager {
    pub(crate) fn initialize_scope(&mut self, scope: Uuid) -> Result<(), WorkflowError> {
        if self.scopes.contains_key(&scope) {
            return Err(WorkflowError::invalid_operation(format!(
                "bookmark scope {scope} is already initialized"
            )));
        }
        self.scopes.insert(scope, BookmarkManager::default());
        self.keys_to_disassociate.retain(|k| *k != scope);
        self.keys_to_associate.push(scope);
        Ok(())
    }

    /// Drop a scope and its bookmarks.
    pub(crate) fn unregister_scope(&mut self, scope: Uuid) -> Vec<(Bookmark, BookmarkRecord)> {
        let Some(mut manager) = self.scopes.remove(&scope) else {
            return Vec::new();
        };
        if let Some(pos) = self.keys_to_associate.iter().position(|k| *k == scope) {
            self.keys_to_associate.remove(pos);
        } else {
            self.keys_to_disassociate.push(scope);
        }
        manager.drain()
    }

    pub fn contains(&self, scope: Uuid) -> bool {
        self.scopes.contains_key(&scope)
    }

    pub(crate) fn scope_mut(&mut self, scope: Uuid) -> Result<&mut BookmarkManager, WorkflowError> {
        self.scopes
            .get_mut(&scope)
            .ok_or_else(|| WorkflowError::invalid_argument(format!("bookmark scope {scope} is not initialized")))
    }

    pub fn scope(&self, scope: Uuid) -> Option<&BookmarkManager> {
        self.scopes.get(&scope)
    }

    pub(crate) fn remove_all(&mut self, owner: InstanceId) -> Vec<(Bookmark, BookmarkRecord)> {
        self.scopes.values_mut().flat_map(|m| m.remove_all(owner)).collect()
    }

    /// Keys gained and lost since the last call.
    pub(crate) fn take_key_changes(&mut self) -> (Vec<Uuid>, Vec<Uuid>) {
        (
            std::mem::take(&mut self.keys_to_associate),
            std::mem::take(&mut self.keys_to_disassociate),
        )
    }

    pub fn pending_key_changes(&self) -> bool {
        !self.keys_to_associate.is_empty() || !self.keys_to_disassociate.is_empty()
    }

    pub fn bookmark_count(&self) -> usize {
        self.scopes.values().map(BookmarkManager::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn named_bookmark_resumes_once() {
        let mut manager = BookmarkManager::default();
        let b = manager
            .create(InstanceId(3), Some("B1"), "resumed", BookmarkOptions::default())
            .unwrap();
        let (item, record) = manager.try_generate_work_item(&b, json!(42), |_| true).unwrap();
        assert_eq!(record.owner, InstanceId(3));
        assert_eq!(item.instance, InstanceId(3));
        match item.kind {
            WorkItemKind::BookmarkResumption { value, callback, .. } => {
                assert_eq!(value, json!(42));
                assert_eq!(callback, "resumed");
            }
            other => panic!("unexpected {other:?}"),
        }
        let again = manager.try_generate_work_item(&b, json!(42), |_| true).unwrap_err();
        assert_eq!(again, BookmarkResumptionResult::NotFound);
    }

    #[test]
    fn not_ready_keeps_bookmark() {
        let mut manager = BookmarkManager::default();
        let b = manager.create(InstanceId(1), None, "cb", BookmarkOptions::default()).unwrap();
        assert_eq!(
            manager.try_generate_work_item(&b, Value::Null, |_| false).unwrap_err(),
            BookmarkResumptionResult::NotReady
        );
        assert!(manager.get(&b).is_some());
    }

    #[test]
    fn duplicate_named_bookmark_is_rejected() {
        let mut manager = BookmarkManager::default();
        manager.create(InstanceId(1), Some("x"), "cb", BookmarkOptions::default()).unwrap();
        let err = manager
            .create(InstanceId(2), Some("x"), "cb", BookmarkOptions::default())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidOperation(_)));
    }

    #[test]
    fn scope_keys_track_association() {
        let mut scopes = BookmarkScopeManager::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        scopes.initialize_scope(a).unwrap();
        scopes.initialize_scope(b).unwrap();
        assert_eq!(scopes.take_key_changes(), (vec![a, b], vec![]));

        scopes
            .scope_mut(a)
            .unwrap()
            .create(InstanceId(1), Some("order"), "cb", BookmarkOptions::default())
            .unwrap();
        let dropped = scopes.unregister_scope(a);
        assert_eq!(dropped.len(), 1);
        assert_eq!(scopes.take_key_changes(), (vec![], vec![a]));
    }

    #[test]
    fn manager_round_trips_through_json() {
        let mut manager = BookmarkManager::default();
        manager.create(InstanceId(1), Some("a"), "cb", BookmarkOptions::default()).unwrap();
        manager.create(InstanceId(2), None, "cb", BookmarkOptions::non_blocking()).unwrap();
        let text = serde_json::to_string(&manager).unwrap();
        let back: BookmarkManager = serde_json::from_str(&text).unwrap();
        assert_eq!(back, manager);
    }
}
