//! The query model: condition groups, the query (disjunction of
//! conjunctions), and translation to document-store predicates.

pub mod ops;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::instance::ToiId;
use crate::value::Value;
use ops::Operator;

/// One conjunction: attribute name (or the special key `"id"`) → operator.
/// All entries must hold for the group to match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub conds: BTreeMap<String, Operator>,
}

impl ConditionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attr: impl Into<String>, op: Operator) -> Self {
        self.conds.insert(attr.into(), op);
        self
    }

    /// `getter(attr)` returns the current sequence for `attr` on the
    /// candidate instance (or `&["id"]` for identity, stringified as a
    /// `Value::ToiRef`). `subqueries` maps each nested `SubQuery` operator's
    /// query identity (by condition-group equality) to its pre-run result
    /// set, since running a sub-query needs a store round-trip this
    /// function does not perform.
    pub fn matches(
        &self,
        getter: &dyn Fn(&str) -> Vec<Value>,
        now: DateTime<Utc>,
        user_privileges: &[Value],
        subquery_results: &BTreeMap<String, BTreeSet<ToiId>>,
    ) -> bool {
        self.conds.iter().all(|(attr, op)| {
            let values = getter(attr);
            let sub = subquery_results.get(attr);
            op.matches(&values, now, user_privileges, sub)
        })
    }

    pub fn referenced_attrs(&self) -> impl Iterator<Item = &String> {
        self.conds.keys()
    }
}

/// A query: disjunction of condition groups, scoped to a class (and its
/// descendants, via the `_bases` ancestor filter).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    pub class: String,
    pub is_root: bool,
    pub groups: Vec<ConditionGroup>,
    /// Attribute projection; identity and class tag are always fetched in
    /// addition to this list.
    pub projection: Vec<String>,
}

impl Query {
    pub fn new(class: impl Into<String>) -> Self {
        Query { class: class.into(), is_root: false, groups: Vec::new(), projection: Vec::new() }
    }

    pub fn push(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn project(mut self, attrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = attrs.into_iter().map(Into::into).collect();
        self
    }

    /// Disjunction across groups: the query matches if ANY group matches.
    pub fn matches(
        &self,
        getter: &dyn Fn(&str) -> Vec<Value>,
        now: DateTime<Utc>,
        user_privileges: &[Value],
        subquery_results: &BTreeMap<String, BTreeSet<ToiId>>,
    ) -> bool {
        if self.groups.is_empty() {
            return true;
        }
        self.groups
            .iter()
            .any(|g| g.matches(getter, now, user_privileges, subquery_results))
    }

    pub fn has_subquery(&self) -> bool {
        self.groups
            .iter()
            .any(|g| g.conds.values().any(|op| matches!(op, Operator::SubQuery(_))))
    }

    pub fn has_fulltext(&self) -> bool {
        self.groups
            .iter()
            .any(|g| g.conds.values().any(|op| matches!(op, Operator::Fulltext(_))))
    }

    pub fn referenced_attrs(&self) -> BTreeSet<String> {
        self.groups
            .iter()
            .flat_map(|g| g.referenced_attrs().cloned())
            .collect()
    }

    /// Order-independent equality: two queries are equal if their class and
    /// condition-group *sets* match, regardless of group order.
    pub fn equivalent(&self, other: &Query) -> bool {
        if self.class != other.class {
            return false;
        }
        let a: BTreeSet<_> = self.groups.iter().map(|g| format!("{g:?}")).collect();
        let b: BTreeSet<_> = other.groups.iter().map(|g| format!("{g:?}")).collect();
        a == b
    }

    /// Translates to a document-store predicate: `_bases` ancestor filter
    /// (skipped for the root class) ANDed with an `$or` of per-group
    /// predicates. `id` rewrites to `_id` (or `_terms.data` under
    /// `Fulltext`); toi-reference attributes get a `.id` field suffix.
    pub fn to_predicate(&self, toiref_attrs: &BTreeSet<String>) -> serde_json::Value {
        let mut top = serde_json::Map::new();
        if !self.is_root {
            top.insert("_bases".to_string(), json!({"$in": [self.class.clone()]}));
        }

        let group_predicates: Vec<serde_json::Value> = self
            .groups
            .iter()
            .map(|g| {
                let mut and_terms = Vec::new();
                for (attr, op) in &g.conds {
                    let field = if attr == "id" {
                        if matches!(op, Operator::Fulltext(_)) {
                            "_terms.data".to_string()
                        } else {
                            "_id".to_string()
                        }
                    } else if toiref_attrs.contains(attr) {
                        format!("{attr}.id")
                    } else {
                        attr.clone()
                    };
                    and_terms.push(op.to_predicate(&field));
                }
                if and_terms.len() == 1 {
                    and_terms.into_iter().next().unwrap()
                } else {
                    json!({"$and": and_terms})
                }
            })
            .collect();

        match group_predicates.len() {
            0 => {}
            1 => {
                if let serde_json::Value::Object(obj) = group_predicates.into_iter().next().unwrap() {
                    for (k, v) in obj {
                        top.insert(k, v);
                    }
                }
            }
            _ => {
                top.insert("$or".to_string(), json!(group_predicates));
            }
        }
        serde_json::Value::Object(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_group_query_matches_and_semantics() {
        let q = Query::new("Test").push(
            ConditionGroup::new()
                .with("name", Operator::In(vec![Value::String("foo".into())]))
                .with("active", Operator::In(vec![Value::Bool(true)])),
        );
        let attrs = BTreeMap::from([
            ("name".to_string(), vec![Value::String("foo".into())]),
            ("active".to_string(), vec![Value::Bool(true)]),
        ]);
        let getter = |a: &str| attrs.get(a).cloned().unwrap_or_default();
        assert!(q.matches(&getter, Utc::now(), &[], &BTreeMap::new()));
    }

    #[test]
    fn multiple_groups_are_disjunction() {
        let q = Query::new("Test")
            .push(ConditionGroup::new().with("name", Operator::In(vec![Value::String("a".into())])))
            .push(ConditionGroup::new().with("name", Operator::In(vec![Value::String("b".into())])));
        let attrs = BTreeMap::from([("name".to_string(), vec![Value::String("b".into())])]);
        let getter = |a: &str| attrs.get(a).cloned().unwrap_or_default();
        assert!(q.matches(&getter, Utc::now(), &[], &BTreeMap::new()));
    }
}
