//! The query operator taxonomy: one variant per operator in the query
//! model's table, each with in-process `matches()` semantics (used by the
//! sorted-query incremental recompute path) and a `to_predicate()`
//! translation to a document-store predicate.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::instance::ToiId;
use crate::restriction::glob_to_regex;
use crate::value::Value;

/// A time marker resolved lazily at evaluation time rather than at query
/// construction time, so a subscribed query re-evaluates "now" on every run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Now {
    pub offset_ms: i64,
    pub resolution_ms: i64,
}

impl Now {
    pub fn evaluate(&self, when: DateTime<Utc>) -> DateTime<Utc> {
        let millis = when.timestamp_millis() + self.offset_ms;
        let resolution = self.resolution_ms.max(1);
        let aligned = millis - millis.rem_euclid(resolution);
        DateTime::from_timestamp_millis(aligned).unwrap_or(when)
    }
}

/// Either a literal bound or a lazily-resolved `Now` marker, for the
/// ordering operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Bound {
    Literal(Value),
    Now(Now),
}

impl Bound {
    fn resolve(&self, when: DateTime<Utc>) -> Value {
        match self {
            Bound::Literal(v) => v.clone(),
            Bound::Now(n) => Value::Timestamp(n.evaluate(when)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operator {
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Exact(Vec<Value>),
    NoneOf(Vec<Value>),
    Less(Bound),
    LessEq(Bound),
    Greater(Bound),
    GreaterEq(Bound),
    Between(Bound, Bound),
    Empty,
    NotEmpty,
    Like(String),
    NotLike(String),
    Ilike(String),
    NotIlike(String),
    RegEx(String),
    HasKey(String),
    LacksKey(String),
    InMap(String, Vec<Value>),
    NoneOfMap(String, Vec<Value>),
    LikeMap(String, String),
    NotLikeMap(String, String),
    IlikeMap(String, String),
    NotIlikeMap(String, String),
    /// Nested query; matches against ids found by running `query_ids` once
    /// up-front (`Query::matches` supplies it from its resolved subqueries).
    SubQuery(Box<crate::query::Query>),
    Fulltext(String),
    /// Implicit allowRead check: matches iff the instance's allowRead set
    /// intersects the querying user's privileges.
    Readable,
}

fn is_empty_seq(values: &[Value]) -> bool {
    values.is_empty()
        || values
            .iter()
            .all(|v| matches!(v, Value::Map(m) if m.is_empty()))
}

impl Operator {
    /// In-process predicate evaluation, used both for validation and for
    /// the sorted-query incremental recompute path. `subquery_results`
    /// supplies the ids matched by any nested `SubQuery` operator (resolved
    /// ahead of time by the caller, since evaluating a sub-query needs a
    /// store round-trip this function does not perform itself).
    pub fn matches(
        &self,
        values: &[Value],
        now: DateTime<Utc>,
        user_privileges: &[Value],
        subquery_results: Option<&BTreeSet<ToiId>>,
    ) -> bool {
        match self {
            Operator::In(set) => values.iter().any(|v| set.contains(v)),
            Operator::NotIn(set) => !values.iter().any(|v| set.contains(v)),
            Operator::Exact(set) => {
                let a: BTreeSet<_> = values.iter().collect();
                let b: BTreeSet<_> = set.iter().collect();
                a == b
            }
            Operator::NoneOf(set) => !values.iter().any(|v| set.contains(v)),
            Operator::Less(b) => values.iter().any(|v| {
                matches!(v.partial_cmp_value(&b.resolve(now)), Some(std::cmp::Ordering::Less))
            }),
            Operator::LessEq(b) => values.iter().any(|v| {
                matches!(
                    v.partial_cmp_value(&b.resolve(now)),
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                )
            }),
            Operator::Greater(b) => values.iter().any(|v| {
                matches!(v.partial_cmp_value(&b.resolve(now)), Some(std::cmp::Ordering::Greater))
            }),
            Operator::GreaterEq(b) => values.iter().any(|v| {
                matches!(
                    v.partial_cmp_value(&b.resolve(now)),
                    Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                )
            }),
            Operator::Between(lo, hi) => {
                let (lo, hi) = (lo.resolve(now), hi.resolve(now));
                values.iter().any(|v| {
                    !matches!(v.partial_cmp_value(&lo), Some(std::cmp::Ordering::Less) | None)
                        && !matches!(v.partial_cmp_value(&hi), Some(std::cmp::Ordering::Greater) | None)
                })
            }
            Operator::Empty => is_empty_seq(values),
            Operator::NotEmpty => !is_empty_seq(values),
            Operator::Like(pat) => str_match(values, pat, false),
            Operator::NotLike(pat) => !str_match(values, pat, false),
            Operator::Ilike(pat) => str_match(values, pat, true),
            Operator::NotIlike(pat) => !str_match(values, pat, true),
            Operator::RegEx(pat) => {
                regex::Regex::new(pat).map(|re| values.iter().any(|v| matches!(v.as_str(), Some(s) if re.is_match(s)))).unwrap_or(false)
            }
            Operator::HasKey(key) => values.iter().any(|v| {
                matches!(v, Value::Map(m) if m.iter().any(|(k, _)| k == key))
            }),
            Operator::LacksKey(key) => !values.iter().any(|v| {
                matches!(v, Value::Map(m) if m.iter().any(|(k, _)| k == key))
            }),
            Operator::InMap(key, set) => map_value_match(values, key, |v| set.contains(v)),
            Operator::NoneOfMap(key, set) => !map_value_match(values, key, |v| set.contains(v)),
            Operator::LikeMap(key, pat) => map_str_match(values, key, pat, false),
            Operator::NotLikeMap(key, pat) => !map_str_match(values, key, pat, false),
            Operator::IlikeMap(key, pat) => map_str_match(values, key, pat, true),
            Operator::NotIlikeMap(key, pat) => !map_str_match(values, key, pat, true),
            Operator::SubQuery(_) => {
                let Some(results) = subquery_results else { return false };
                values
                    .iter()
                    .any(|v| matches!(v, Value::ToiRef(id) if results.contains(id)))
            }
            // Fulltext resolution requires an external term index; absent
            // one (the default `NullTextIndexer`), it never matches.
            Operator::Fulltext(_) => false,
            Operator::Readable => values.iter().any(|v| user_privileges.contains(v)),
        }
    }

    /// Translates to a JSON document-store predicate, mirroring the shape
    /// the original's `mongo()` method emits (operator objects keyed by
    /// Mongo-style `$`-prefixed operator names).
    pub fn to_predicate(&self, field: &str) -> serde_json::Value {
        match self {
            Operator::In(set) => json!({field: {"$in": set}}),
            Operator::NotIn(set) => json!({field: {"$nin": set}}),
            Operator::Exact(set) => json!({field: {"$all": set, "$size": set.len()}}),
            Operator::NoneOf(set) => json!({"$nor": [{field: {"$in": set}}]}),
            Operator::Less(b) => json!({field: {"$elemMatch": {"$lt": bound_json(b)}}}),
            Operator::LessEq(b) => json!({field: {"$elemMatch": {"$lte": bound_json(b)}}}),
            Operator::Greater(b) => json!({field: {"$elemMatch": {"$gt": bound_json(b)}}}),
            Operator::GreaterEq(b) => json!({field: {"$elemMatch": {"$gte": bound_json(b)}}}),
            Operator::Between(lo, hi) => {
                json!({field: {"$elemMatch": {"$gte": bound_json(lo), "$lte": bound_json(hi)}}})
            }
            Operator::Empty => json!({field: {"$in": [serde_json::Value::Null, [], {}]}}),
            Operator::NotEmpty => json!({field: {"$exists": true, "$ne": []}}),
            Operator::Like(pat) => json!({field: {"$regex": glob_pattern_source(pat, false)}}),
            Operator::NotLike(pat) => json!({field: {"$not": {"$regex": glob_pattern_source(pat, false)}}}),
            Operator::Ilike(pat) => json!({field: {"$regex": glob_pattern_source(pat, true), "$options": "i"}}),
            Operator::NotIlike(pat) => {
                json!({field: {"$not": {"$regex": glob_pattern_source(pat, true), "$options": "i"}}})
            }
            Operator::RegEx(pat) => json!({field: {"$regex": pat}}),
            Operator::HasKey(key) => json!({format!("{field}.{key}"): {"$exists": true}}),
            Operator::LacksKey(key) => json!({format!("{field}.{key}"): {"$exists": false}}),
            Operator::InMap(key, set) => json!({format!("{field}.{key}"): {"$in": set}}),
            Operator::NoneOfMap(key, set) => json!({"$nor": [{format!("{field}.{key}"): {"$in": set}}]}),
            Operator::LikeMap(key, pat) => {
                json!({format!("{field}.{key}"): {"$regex": glob_pattern_source(pat, false)}})
            }
            Operator::NotLikeMap(key, pat) => {
                json!({format!("{field}.{key}"): {"$not": {"$regex": glob_pattern_source(pat, false)}}})
            }
            Operator::IlikeMap(key, pat) => {
                json!({format!("{field}.{key}"): {"$regex": glob_pattern_source(pat, true), "$options": "i"}})
            }
            Operator::NotIlikeMap(key, pat) => {
                json!({format!("{field}.{key}"): {"$not": {"$regex": glob_pattern_source(pat, true), "$options": "i"}}})
            }
            Operator::SubQuery(_) => json!({field: {"$subquery": true}}),
            Operator::Fulltext(term) => json!({"_terms.data": {"$fulltext": term}}),
            Operator::Readable => json!({"allowRead": {"$exists": true}}),
        }
    }

    /// Which attribute kinds may declare this operator. Used by the schema
    /// registry / class builder to reject invalid operator/kind pairings.
    pub fn category(&self) -> &'static str {
        match self {
            Operator::In(_) | Operator::NotIn(_) | Operator::Exact(_) | Operator::NoneOf(_) => "equality",
            Operator::Less(_) | Operator::LessEq(_) | Operator::Greater(_) | Operator::GreaterEq(_) | Operator::Between(_, _) => "ordering",
            Operator::Empty | Operator::NotEmpty => "emptiness",
            Operator::Like(_) | Operator::NotLike(_) | Operator::Ilike(_) | Operator::NotIlike(_) | Operator::RegEx(_) => "string-match",
            Operator::HasKey(_) | Operator::LacksKey(_) | Operator::InMap(_, _) | Operator::NoneOfMap(_, _)
            | Operator::LikeMap(_, _) | Operator::NotLikeMap(_, _) | Operator::IlikeMap(_, _) | Operator::NotIlikeMap(_, _) => "map",
            Operator::SubQuery(_) | Operator::Fulltext(_) => "relation",
            Operator::Readable => "visibility",
        }
    }
}

fn bound_json(b: &Bound) -> serde_json::Value {
    match b {
        Bound::Literal(v) => serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
        Bound::Now(n) => json!({"$now": {"offset_ms": n.offset_ms, "resolution_ms": n.resolution_ms}}),
    }
}

fn glob_pattern_source(glob: &str, ci: bool) -> String {
    glob_to_regex(glob, ci).map(|re| re.as_str().to_string()).unwrap_or_default()
}

fn str_match(values: &[Value], glob: &str, ci: bool) -> bool {
    let Ok(re) = glob_to_regex(glob, ci) else { return false };
    values.iter().any(|v| matches!(v.as_str(), Some(s) if re.is_match(s)))
}

fn map_value_match(values: &[Value], key: &str, pred: impl Fn(&Value) -> bool) -> bool {
    values.iter().any(|v| {
        matches!(v, Value::Map(m) if m.iter().any(|(k, val)| k == key && pred(val)))
    })
}

fn map_str_match(values: &[Value], key: &str, glob: &str, ci: bool) -> bool {
    let Ok(re) = glob_to_regex(glob, ci) else { return false };
    values.iter().any(|v| {
        matches!(v, Value::Map(m) if m.iter().any(|(k, val)| {
            k == key && matches!(val.as_str(), Some(s) if re.is_match(s))
        }))
    })
}
