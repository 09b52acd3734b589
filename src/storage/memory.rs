//! In-memory `StorageBackend`: an `RwLock`-guarded document map plus a
//! small JSON-predicate interpreter covering the operator shapes the query
//! model's `to_predicate()` emits. Intended for tests and embedding, not
//! production use — same role as the teacher's `MemoryBackend`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::instance::ToiId;
use crate::storage::{Document, IndexSpec, StorageBackend, StorageCapabilities, WriteOp};

#[derive(Default)]
struct Inner {
    docs: std::collections::BTreeMap<ToiId, Document>,
}

pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend { inner: Arc::new(RwLock::new(Inner::default())) }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn find(&self, predicate: &Json, _projection: &[String]) -> Result<Vec<Document>> {
        let inner = self.inner.read();
        Ok(inner
            .docs
            .values()
            .filter(|d| doc_matches(d, predicate))
            .cloned()
            .collect())
    }

    async fn find_one(&self, id: ToiId) -> Result<Option<Document>> {
        Ok(self.inner.read().docs.get(&id).cloned())
    }

    async fn count(&self, predicate: &Json) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner.docs.values().filter(|d| doc_matches(d, predicate)).count() as u64)
    }

    async fn insert(&self, doc: Document) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.docs.contains_key(&doc.id) {
            return Err(Error::Internal(format!("duplicate id {}", doc.id)));
        }
        inner.docs.insert(doc.id, doc);
        Ok(())
    }

    async fn lock_unhandled(&self, ids: &BTreeSet<ToiId>, handler: &str) -> Result<BTreeSet<ToiId>> {
        let mut inner = self.inner.write();
        let mut locked = BTreeSet::new();
        for id in ids {
            if let Some(doc) = inner.docs.get_mut(id) {
                if doc.handled_by.is_none() {
                    doc.handled_by = Some(handler.to_string());
                    locked.insert(*id);
                }
            }
        }
        Ok(locked)
    }

    async fn unlock(&self, handler: &str) -> Result<()> {
        let mut inner = self.inner.write();
        for doc in inner.docs.values_mut() {
            if doc.handled_by.as_deref() == Some(handler) {
                doc.handled_by = None;
            }
        }
        Ok(())
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut inner = self.inner.write();
        for op in ops {
            match op {
                WriteOp::Insert(doc) => {
                    inner.docs.insert(doc.id, doc);
                }
                WriteOp::SetAttrs { id, attrs } => {
                    if let Some(doc) = inner.docs.get_mut(&id) {
                        for (k, v) in attrs {
                            doc.attrs.insert(k, v);
                        }
                    }
                }
                WriteOp::Delete(id) => {
                    inner.docs.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn ensure_indexes(&self, _specs: &[IndexSpec]) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            supports_fulltext: false,
            supports_transactions: false,
            max_batch_size: None,
        }
    }
}

fn field_values(doc: &Document, field: &str) -> Vec<Json> {
    use crate::value::Value;

    if field == "_id" {
        return vec![Json::String(doc.id.to_hex())];
    }
    if field == "_bases" {
        return doc.bases.iter().map(|b| Json::String(b.clone())).collect();
    }
    if field == "allowRead" {
        return doc.allow_read.iter().filter_map(|v| serde_json::to_value(v).ok()).collect();
    }
    if let Some(attr) = field.strip_suffix(".id") {
        return doc
            .attrs
            .get(attr)
            .into_iter()
            .flatten()
            .filter_map(|v| match v {
                Value::ToiRef(id) => Some(Json::String(id.to_hex())),
                _ => None,
            })
            .collect();
    }
    if let Some((attr, key)) = field.split_once('.') {
        return doc
            .attrs
            .get(attr)
            .into_iter()
            .flatten()
            .filter_map(|v| match v {
                Value::Map(m) => m.iter().find(|(k, _)| k == key).and_then(|(_, v)| serde_json::to_value(v).ok()),
                _ => None,
            })
            .collect();
    }
    doc.attrs
        .get(field)
        .into_iter()
        .flatten()
        .filter_map(|v| serde_json::to_value(v).ok())
        .collect()
}

fn scalar_cmp(a: &Json, b: &Json) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Evaluates a single `{"$op": operand, ...}` object (keys ANDed) against a
/// field's resolved value sequence.
fn eval_ops(values: &[Json], ops: &serde_json::Map<String, Json>) -> bool {
    ops.iter().all(|(op, operand)| match op.as_str() {
        "$in" => {
            let arr = operand.as_array().cloned().unwrap_or_default();
            values.iter().any(|v| arr.contains(v))
        }
        "$nin" => {
            let arr = operand.as_array().cloned().unwrap_or_default();
            !values.iter().any(|v| arr.contains(v))
        }
        "$all" => {
            let arr = operand.as_array().cloned().unwrap_or_default();
            arr.iter().all(|want| values.contains(want))
        }
        "$size" => values.len() as u64 == operand.as_u64().unwrap_or(0),
        "$exists" => {
            let want = operand.as_bool().unwrap_or(true);
            want == !values.is_empty()
        }
        "$ne" => !values.contains(operand),
        "$elemMatch" => {
            let Some(nested) = operand.as_object() else { return false };
            values.iter().any(|v| eval_ops(std::slice::from_ref(v), nested))
        }
        "$gt" => values.iter().any(|v| scalar_cmp(v, operand) == Some(std::cmp::Ordering::Greater)),
        "$gte" => values.iter().any(|v| matches!(scalar_cmp(v, operand), Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal))),
        "$lt" => values.iter().any(|v| scalar_cmp(v, operand) == Some(std::cmp::Ordering::Less)),
        "$lte" => values.iter().any(|v| matches!(scalar_cmp(v, operand), Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal))),
        "$regex" => {
            let pattern = operand.as_str().unwrap_or("");
            let ci = ops.get("$options").and_then(|o| o.as_str()).map(|s| s.contains('i')).unwrap_or(false);
            let built = if ci { format!("(?i){pattern}") } else { pattern.to_string() };
            regex::Regex::new(&built)
                .map(|re| values.iter().any(|v| matches!(v, Json::String(s) if re.is_match(s))))
                .unwrap_or(false)
        }
        "$options" => true, // consumed alongside $regex
        "$not" => {
            let Some(nested) = operand.as_object() else { return false };
            !eval_ops(values, nested)
        }
        "$fulltext" => false,
        _ => false,
    })
}

fn doc_matches(doc: &Document, pred: &Json) -> bool {
    let Some(obj) = pred.as_object() else { return true };
    obj.iter().all(|(key, val)| match key.as_str() {
        "$or" => val.as_array().map(|arr| arr.iter().any(|p| doc_matches(doc, p))).unwrap_or(true),
        "$and" => val.as_array().map(|arr| arr.iter().all(|p| doc_matches(doc, p))).unwrap_or(true),
        "$nor" => val.as_array().map(|arr| !arr.iter().any(|p| doc_matches(doc, p))).unwrap_or(true),
        field => {
            let values = field_values(doc, field);
            match val.as_object() {
                Some(ops) => eval_ops(&values, ops),
                None => values.contains(val),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::AttrData;
    use crate::value::Value;
    use serde_json::json;

    fn doc(id: ToiId, name: &str) -> Document {
        let mut attrs = AttrData::new();
        attrs.insert("name".to_string(), vec![Value::String(name.to_string())]);
        Document { id, toc: "Test".into(), bases: vec!["Test".into()], handled_by: None, attrs, allow_read: vec![] }
    }

    #[tokio::test]
    async fn find_matches_in_predicate() {
        let be = MemoryBackend::new();
        let id = ToiId::generate([0; 5]);
        be.insert(doc(id, "foo")).await.unwrap();
        let pred = json!({"name": {"$in": ["foo"]}});
        let found = be.find(&pred, &[]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn lock_unhandled_excludes_already_locked() {
        let be = MemoryBackend::new();
        let id = ToiId::generate([0; 5]);
        be.insert(doc(id, "foo")).await.unwrap();
        let mut ids = BTreeSet::new();
        ids.insert(id);
        let locked = be.lock_unhandled(&ids, "worker-1").await.unwrap();
        assert_eq!(locked, ids);
        let locked_again = be.lock_unhandled(&ids, "worker-2").await.unwrap();
        assert!(locked_again.is_empty());
    }
}
