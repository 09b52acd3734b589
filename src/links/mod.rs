//! The subscription/link engine: long-lived client subscriptions that
//! receive an update payload whenever a commit touches data they care
//! about (§4.7).
//!
//! Four link kinds: `CallMethod` (a one-shot snapshot of a method call),
//! `Request` (one instance's attributes, respecting `allowRead`), `Query`
//! (the full id result set of a query), and `SortedQuery` (the same, order
//! preserved, with an incremental reorder path that avoids a full re-sort
//! when the prior result is recent and the query has no sub-query or
//! fulltext term).

pub mod diff;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::commit::{CommitEngine, CommitRecord, Operation};
use crate::error::Result;
use crate::instance::ToiId;
use crate::links::diff::{diff_opcodes, Opcode};
use crate::query::Query;
use crate::registry::SchemaRegistry;
use crate::storage::StorageBackend;
use crate::value::Value;

/// How long a sorted-query link's cached result may go unused before a
/// re-run falls back to a full recompute instead of the incremental path.
pub const ANCIENT_THRESHOLD_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub enum CallTarget {
    Instance(ToiId),
    Class(String),
}

#[derive(Debug, Clone)]
pub enum LinkKind {
    CallMethod { target: CallTarget, method: String, args: Vec<Vec<Value>> },
    Request { toid: ToiId, attrs: Vec<String> },
    Query { query: Query },
    SortedQuery { query: Query, sort_attr: String, descending: bool },
}

/// A subscribed link: its query/target, the subscriber's privileges, and
/// (for `SortedQuery`) the cached result the incremental path diffs against.
pub struct Link {
    pub id: String,
    pub kind: LinkKind,
    pub user_privileges: Vec<Value>,
    pub is_super: bool,
    pub last_result: Option<Vec<ToiId>>,
    pub last_run: Option<DateTime<Utc>>,
}

impl Link {
    pub fn new(id: impl Into<String>, kind: LinkKind, user_privileges: Vec<Value>, is_super: bool) -> Self {
        Link { id: id.into(), kind, user_privileges, is_super, last_result: None, last_run: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    /// `{result, error}` — exactly one is populated, mirroring the source's
    /// `CallMethod` link payload shape (§4.7).
    MethodResult { result: Vec<Value>, error: Option<String> },
    Instance { toid: ToiId, attrs: BTreeMap<String, Vec<Value>> },
    ResultSet(Vec<ToiId>),
    Reorder(Vec<Opcode<ToiId>>),
}

struct Delta {
    added: Vec<ToiId>,
    removed: Vec<ToiId>,
}

pub struct LinkEngine {
    pub registry: Arc<SchemaRegistry>,
    pub store: Arc<dyn StorageBackend>,
    pub commits: Arc<CommitEngine>,
}

impl LinkEngine {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn StorageBackend>, commits: Arc<CommitEngine>) -> Self {
        LinkEngine { registry, store, commits }
    }

    /// Runs a link from scratch: used on first subscribe, and by
    /// `notify_changes` for every kind except a non-ancient `SortedQuery`.
    pub async fn run(&self, link: &mut Link) -> Result<LinkUpdate> {
        let now = Utc::now();
        let update = match &link.kind {
            LinkKind::CallMethod { target, method, args } => {
                self.run_call(link, target, method, args).await?
            }
            LinkKind::Request { toid, attrs } => self.run_request(link, *toid, attrs).await?,
            LinkKind::Query { query } => LinkUpdate::ResultSet(self.run_query(link, query).await?),
            LinkKind::SortedQuery { query, sort_attr, descending } => {
                let ids = self.run_query(link, query).await?;
                let sorted = self.sort_ids(&ids, sort_attr, *descending).await?;
                link.last_result = Some(sorted.clone());
                LinkUpdate::ResultSet(sorted)
            }
        };
        link.last_run = Some(now);
        Ok(update)
    }

    /// The final step of a commit (§4.6): re-runs every link the commit
    /// could have affected, returning the ones that actually produced a
    /// new payload. `CallMethod`/`Request` links only re-run when their
    /// target id is among the commit's affected ids; `Query`/`SortedQuery`
    /// links re-run on any commit, since membership in an arbitrary
    /// predicate can't be ruled out without evaluating it.
    pub async fn notify_changes(&self, links: &mut [Link], record: &CommitRecord) -> Vec<(String, LinkUpdate)> {
        let affected: BTreeSet<ToiId> = record.affected_ids().cloned().collect();
        if affected.is_empty() {
            return Vec::new();
        }
        let mut updates = Vec::new();
        for link in links.iter_mut() {
            let relevant = match &link.kind {
                LinkKind::CallMethod { target: CallTarget::Instance(id), .. } => affected.contains(id),
                LinkKind::CallMethod { target: CallTarget::Class(_), .. } => true,
                LinkKind::Request { toid, .. } => affected.contains(toid),
                LinkKind::Query { .. } | LinkKind::SortedQuery { .. } => true,
            };
            if !relevant {
                continue;
            }
            if let Ok(Some(update)) = self.run_tagged(link, &affected).await {
                updates.push((link.id.clone(), update));
            }
        }
        updates
    }

    async fn run_tagged(&self, link: &mut Link, affected: &BTreeSet<ToiId>) -> Result<Option<LinkUpdate>> {
        let LinkKind::SortedQuery { query, sort_attr, descending } = &link.kind else {
            return self.run(link).await.map(Some);
        };
        let query = query.clone();
        let sort_attr = sort_attr.clone();
        let descending = *descending;
        let now = Utc::now();
        let ancient = link.last_run.map(|t| (now - t).num_seconds() >= ANCIENT_THRESHOLD_SECS).unwrap_or(true);
        let incremental = !ancient && link.last_result.is_some() && !query.has_subquery() && !query.has_fulltext();

        if !incremental {
            let ids = self.run_query(link, &query).await?;
            let sorted = self.sort_ids(&ids, &sort_attr, descending).await?;
            let changed = link.last_result.as_ref() != Some(&sorted);
            link.last_result = Some(sorted.clone());
            link.last_run = Some(now);
            return Ok(changed.then_some(LinkUpdate::ResultSet(sorted)));
        }

        let prev = link.last_result.clone().unwrap_or_default();
        let delta = self.restricted_delta(link, &query, affected).await?;
        let mut merged: BTreeSet<ToiId> = prev.iter().cloned().collect();
        for id in delta.added {
            merged.insert(id);
        }
        for id in delta.removed {
            merged.remove(&id);
        }
        let sorted = self.sort_ids(&merged.into_iter().collect::<Vec<_>>(), &sort_attr, descending).await?;
        let ops = diff_opcodes(&prev, &sorted);
        link.last_result = Some(sorted);
        link.last_run = Some(now);
        if ops.is_empty() {
            Ok(None)
        } else {
            Ok(Some(LinkUpdate::Reorder(ops)))
        }
    }

    /// Local id-restricted requery: only the commit's own affected ids are
    /// re-evaluated against the query's in-process predicate, instead of
    /// re-running the predicate across the whole store (§4.7).
    async fn restricted_delta(&self, link: &Link, query: &Query, affected: &BTreeSet<ToiId>) -> Result<Delta> {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let now = Utc::now();
        for &id in affected {
            let is_match = match self.store.find_one(id).await? {
                Some(doc) if query.is_root || doc.bases.contains(&query.class) => {
                    let visible = link.is_super || doc.allow_read.iter().any(|v| link.user_privileges.contains(v));
                    visible
                        && query.matches(
                            &|attr| doc.attrs.get(attr).cloned().unwrap_or_default(),
                            now,
                            &link.user_privileges,
                            &BTreeMap::new(),
                        )
                }
                _ => false,
            };
            if is_match {
                added.push(id);
            } else {
                removed.push(id);
            }
        }
        Ok(Delta { added, removed })
    }

    /// Stages the method call as a one-operation commit (`CallToi`/`CallBlm`)
    /// through the commit engine, so a method call gets the same argument
    /// coercion/padding and return-type post-validation a direct commit
    /// would — then reports the commit's outcome as the link's one-shot
    /// `{result, error}` payload (§4.7). The source deletes the backing
    /// commit record once delivered; this crate doesn't persist `CallMethod`
    /// commit records in the first place (see DESIGN.md), so there is
    /// nothing left to clean up.
    async fn run_call(&self, link: &Link, target: &CallTarget, method: &str, args: &[Vec<Value>]) -> Result<LinkUpdate> {
        let op = match target {
            CallTarget::Instance(id) => Operation::CallToi { id: *id, method: method.to_string(), args: args.to_vec() },
            CallTarget::Class(class) => Operation::CallBlm { class: class.clone(), method: method.to_string(), args: args.to_vec() },
        };
        let record = self
            .commits
            .commit(link.user_privileges.clone(), link.is_super, format!("link-call-{}", link.id), vec![op])
            .await;
        match record.state {
            crate::commit::CommitState::Done => {
                let result = match record.results.into_iter().next() {
                    Some(crate::commit::OpResult::Value(v)) => v,
                    _ => Vec::new(),
                };
                Ok(LinkUpdate::MethodResult { result, error: None })
            }
            _ => Ok(LinkUpdate::MethodResult { result: Vec::new(), error: record.error }),
        }
    }

    async fn run_request(&self, link: &Link, toid: ToiId, attrs: &[String]) -> Result<LinkUpdate> {
        let Some(doc) = self.store.find_one(toid).await? else {
            return Ok(LinkUpdate::Instance { toid, attrs: BTreeMap::new() });
        };
        if !link.is_super && !doc.allow_read.iter().any(|v| link.user_privileges.contains(v)) {
            return Ok(LinkUpdate::Instance { toid, attrs: BTreeMap::new() });
        }
        let mut out = BTreeMap::new();
        for a in attrs {
            if let Some(v) = doc.attrs.get(a) {
                out.insert(a.clone(), v.clone());
            }
        }
        Ok(LinkUpdate::Instance { toid, attrs: out })
    }

    async fn run_query(&self, link: &Link, query: &Query) -> Result<Vec<ToiId>> {
        let toiref_attrs = self.toiref_attrs(&query.class)?;
        let predicate = query.to_predicate(&toiref_attrs);
        let docs = self.store.find(&predicate, &query.projection).await?;
        let mut ids: Vec<ToiId> = docs
            .into_iter()
            .filter(|d| link.is_super || d.allow_read.iter().any(|v| link.user_privileges.contains(v)))
            .map(|d| d.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn sort_ids(&self, ids: &[ToiId], sort_attr: &str, descending: bool) -> Result<Vec<ToiId>> {
        let mut pairs = Vec::with_capacity(ids.len());
        for &id in ids {
            let key = match self.store.find_one(id).await? {
                Some(doc) => doc.attrs.get(sort_attr).and_then(|v| v.first()).cloned(),
                None => None,
            };
            pairs.push((id, key));
        }
        pairs.sort_by(|a, b| match (&a.1, &b.1) {
            (Some(x), Some(y)) => x.partial_cmp_value(y).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        if descending {
            pairs.reverse();
        }
        Ok(pairs.into_iter().map(|(id, _)| id).collect())
    }

    fn toiref_attrs(&self, class_name: &str) -> Result<BTreeSet<String>> {
        let class = self.registry.require_class(class_name)?;
        Ok(class.relation_attrs().map(|a| a.name.clone()).collect())
    }
}

// S5 and the Request/CallMethod delivery scenarios are covered
// end-to-end in `tests/e2e_links.rs` through the public API.
