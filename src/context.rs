//! The context stack: read-only and commit contexts. Per the redesign note
//! in the design notes (thread-local global → explicit context parameter),
//! contexts are ordinary values passed explicitly to every operation rather
//! than pushed onto a thread-local broker; callers that want scoped
//! acquisition can wrap construction in their own `with`-style helper.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::instance::{AttrData, Toi, ToiId};
use crate::query::Query;
use crate::storage::StorageBackend;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    ReadOnly,
    ReadWrite,
}

/// Cached query results, keyed by the query's predicate identity (its
/// `Debug` rendering stands in for "frozen predicate").
#[derive(Default)]
pub struct QueryCache {
    entries: BTreeMap<String, (Vec<String>, Vec<ToiId>)>,
}

impl QueryCache {
    fn key(query: &Query) -> String {
        format!("{query:?}")
    }

    pub fn get(&self, query: &Query) -> Option<&(Vec<String>, Vec<ToiId>)> {
        self.entries.get(&Self::key(query))
    }

    pub fn put(&mut self, query: &Query, projection: Vec<String>, results: Vec<ToiId>) {
        self.entries.insert(Self::key(query), (projection, results));
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }
}

/// A read-only scope: database handle, user identity, the identity map,
/// the query cache, and a preload set for batching attribute fetches.
pub struct ReadContext {
    pub mode: ContextMode,
    pub store: Arc<dyn StorageBackend>,
    pub user_privileges: Vec<Value>,
    pub is_super: bool,
    identity_map: BTreeMap<ToiId, Toi>,
    pub query_cache: QueryCache,
    preload: BTreeMap<ToiId, BTreeSet<String>>,
}

impl ReadContext {
    pub fn new(store: Arc<dyn StorageBackend>, user_privileges: Vec<Value>, is_super: bool) -> Self {
        ReadContext {
            mode: ContextMode::ReadOnly,
            store,
            user_privileges,
            is_super,
            identity_map: BTreeMap::new(),
            query_cache: QueryCache::default(),
            preload: BTreeMap::new(),
        }
    }

    /// At most one live instance per (id, context): returns the existing
    /// instance if already loaded.
    pub fn get_toi(&self, id: ToiId) -> Option<&Toi> {
        self.identity_map.get(&id)
    }

    pub fn get_toi_mut(&mut self, id: ToiId) -> Option<&mut Toi> {
        self.identity_map.get_mut(&id)
    }

    /// Returns the identity-mapped instance for `id`, or inserts a fresh
    /// phantom of `class`. Re-tagging an already-mapped instance to a more
    /// specific class (metamorphosis) is the schema registry's call, not
    /// the context's — it owns the ancestry information needed to validate
    /// the retag and does so via `get_toi_mut` directly.
    pub fn create_or_get(&mut self, id: ToiId, class: &str) -> &mut Toi {
        self.identity_map
            .entry(id)
            .or_insert_with(|| Toi::new_phantom(id, class))
    }

    pub fn insert_loaded(&mut self, toi: Toi) {
        self.identity_map.insert(toi.id, toi);
    }

    pub fn mark_preload(&mut self, id: ToiId, attrs: impl IntoIterator<Item = String>) {
        self.preload.entry(id).or_default().extend(attrs);
    }

    pub fn take_preload(&mut self, id: ToiId) -> BTreeSet<String> {
        self.preload.remove(&id).unwrap_or_default()
    }

    pub fn can_read(&self, allow_read: &[Value]) -> bool {
        self.is_super || allow_read.iter().any(|v| self.user_privileges.contains(v))
    }

    pub fn all_tois(&self) -> impl Iterator<Item = &Toi> {
        self.identity_map.values()
    }
}

/// A write-enabled context: extends a read context with the staged
/// new/changed/deleted sets, blob reference deltas, a generation counter
/// for commit retry, and the may-change gate operations must check before
/// mutating.
pub struct CommitContext {
    pub read: ReadContext,
    pub id: String,
    pub generation: u32,
    pub new_tois: BTreeSet<ToiId>,
    pub changed_tois: BTreeSet<ToiId>,
    pub deleted_tois: BTreeSet<ToiId>,
    pub added_blob_refs: Vec<(String, ToiId)>,
    pub removed_blob_refs: Vec<(String, ToiId)>,
    pub index_data: Vec<(ToiId, Vec<String>)>,
    may_change: bool,
}

impl CommitContext {
    pub fn new(read: ReadContext, id: impl Into<String>) -> Self {
        let mut read = read;
        read.mode = ContextMode::ReadWrite;
        CommitContext {
            read,
            id: id.into(),
            generation: 0,
            new_tois: BTreeSet::new(),
            changed_tois: BTreeSet::new(),
            deleted_tois: BTreeSet::new(),
            added_blob_refs: Vec::new(),
            removed_blob_refs: Vec::new(),
            index_data: Vec::new(),
            may_change: false,
        }
    }

    /// New instances are always writable; others require `set_may_change`
    /// to have been called for the current operation.
    pub fn can_write(&self, id: ToiId) -> bool {
        self.new_tois.contains(&id) || self.may_change
    }

    pub fn can_delete(&self, _id: ToiId) -> bool {
        true
    }

    pub fn set_may_change(&mut self, v: bool) {
        self.may_change = v;
    }

    pub fn register_new(&mut self, id: ToiId) {
        self.new_tois.insert(id);
        self.changed_tois.remove(&id);
        self.deleted_tois.remove(&id);
    }

    pub fn register_changed(&mut self, id: ToiId) {
        if !self.new_tois.contains(&id) {
            self.changed_tois.insert(id);
        }
    }

    pub fn register_deleted(&mut self, id: ToiId) {
        if self.new_tois.remove(&id) {
            // A toi created and deleted within the same commit never hits
            // the store at all.
            return;
        }
        self.changed_tois.remove(&id);
        self.deleted_tois.insert(id);
    }

    pub fn affected_ids(&self) -> BTreeSet<ToiId> {
        self.changed_tois.union(&self.deleted_tois).cloned().collect()
    }

    /// Starts a fresh context for `rerunCommit`: same store/user, empty
    /// staging sets, generation incremented.
    pub fn rerun(store: Arc<dyn StorageBackend>, user_privileges: Vec<Value>, is_super: bool, id: impl Into<String>, generation: u32) -> Self {
        let mut ctx = CommitContext::new(ReadContext::new(store, user_privileges, is_super), id);
        ctx.generation = generation;
        ctx
    }
}

/// Snapshot of an attribute's committed-vs-staged state, used both to build
/// the conflict-detection baseline and to diff relations. See
/// `commit::DiffToi` for the richer record kept across a whole instance.
pub fn baseline_of(toi: &Toi, attr: &str) -> Option<Vec<Value>> {
    toi.modified.get(attr).cloned()
}

pub type Attrs = AttrData;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn store() -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn create_or_get_returns_the_same_instance_on_repeat_lookup() {
        let mut ctx = ReadContext::new(store(), vec![], true);
        let id = ToiId::generate([1; 5]);
        ctx.create_or_get(id, "demo.Person");
        assert!(ctx.get_toi(id).is_some());
        // A second create_or_get for the same id must not replace the phantom.
        ctx.get_toi_mut(id).unwrap().stage("name", vec![Value::String("Ada".into())]);
        ctx.create_or_get(id, "demo.Person");
        assert!(ctx.get_toi(id).unwrap().is_modified("name"));
    }

    #[test]
    fn can_read_is_always_true_for_super_users() {
        let ctx = ReadContext::new(store(), vec![], true);
        assert!(ctx.can_read(&[]));
    }

    #[test]
    fn can_read_requires_a_privilege_intersection_for_non_super_users() {
        let ctx = ReadContext::new(store(), vec![Value::String("group-a".into())], false);
        assert!(ctx.can_read(&[Value::String("group-a".into())]));
        assert!(!ctx.can_read(&[Value::String("group-b".into())]));
        assert!(!ctx.can_read(&[]));
    }

    #[test]
    fn new_tois_are_always_writable_without_may_change() {
        let mut ctx = CommitContext::new(ReadContext::new(store(), vec![], true), "c1");
        let id = ToiId::generate([2; 5]);
        ctx.register_new(id);
        assert!(ctx.can_write(id));
        assert!(!ctx.can_write(ToiId::generate([3; 5])), "an unrelated id stays gated");
    }

    #[test]
    fn existing_tois_require_may_change_to_be_writable() {
        let mut ctx = CommitContext::new(ReadContext::new(store(), vec![], true), "c1");
        let id = ToiId::generate([4; 5]);
        assert!(!ctx.can_write(id));
        ctx.set_may_change(true);
        assert!(ctx.can_write(id));
    }

    #[test]
    fn register_deleted_drops_a_never_persisted_new_toi_entirely() {
        let mut ctx = CommitContext::new(ReadContext::new(store(), vec![], true), "c1");
        let id = ToiId::generate([5; 5]);
        ctx.register_new(id);
        ctx.register_deleted(id);
        assert!(!ctx.new_tois.contains(&id));
        assert!(!ctx.deleted_tois.contains(&id), "create+delete in one commit never hits the store");
        assert!(ctx.affected_ids().is_empty());
    }

    #[test]
    fn affected_ids_is_the_union_of_changed_and_deleted() {
        let mut ctx = CommitContext::new(ReadContext::new(store(), vec![], true), "c1");
        let changed = ToiId::generate([6; 5]);
        let deleted = ToiId::generate([7; 5]);
        ctx.register_changed(changed);
        ctx.register_deleted(deleted);
        let affected = ctx.affected_ids();
        assert!(affected.contains(&changed));
        assert!(affected.contains(&deleted));
        assert_eq!(affected.len(), 2);
    }

    #[test]
    fn rerun_starts_clean_staging_sets_at_the_requested_generation() {
        let ctx = CommitContext::rerun(store(), vec![], true, "c1", 2);
        assert_eq!(ctx.generation, 2);
        assert!(ctx.new_tois.is_empty());
        assert!(ctx.changed_tois.is_empty());
    }
}
