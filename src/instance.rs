//! Instance identity and the in-memory instance (`Toi`) shape.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Opaque, globally unique, sortable 12-byte identifier (mirrors a Mongo
/// ObjectId: 4-byte timestamp, 5-byte machine/process tag, 3-byte counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToiId([u8; 12]);

static COUNTER: AtomicU32 = AtomicU32::new(0);

impl ToiId {
    /// Generates a fresh id. `machine_tag` should be stable per process
    /// (e.g. derived from a hostname+pid hash) so ids stay globally unique
    /// across workers without coordination.
    pub fn generate(machine_tag: [u8; 5]) -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&machine_tag);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        ToiId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ToiId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ToiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// `name → sequence` attribute data, as stored in committed or staged form.
pub type AttrData = HashMap<String, Vec<Value>>;

/// A live in-memory instance: identity, class, committed data, and the
/// modification baseline that doubles as the undo record and the
/// conflict-detection baseline during commit.
#[derive(Debug, Clone)]
pub struct Toi {
    pub id: ToiId,
    pub class: String,
    /// Current, possibly-uncommitted attribute values.
    pub attrs: AttrData,
    /// Prior committed value for every attribute touched in this context;
    /// populated lazily on first mutation. Doubles as the conflict-detection
    /// baseline (`orgAttrs`) at commit time.
    pub modified: AttrData,
    pub deleted: bool,
    /// True until the instance is known to exist in the store.
    pub phantom: bool,
}

impl Toi {
    pub fn new_phantom(id: ToiId, class: impl Into<String>) -> Self {
        Toi {
            id,
            class: class.into(),
            attrs: HashMap::new(),
            modified: HashMap::new(),
            deleted: false,
            phantom: true,
        }
    }

    pub fn from_committed(id: ToiId, class: impl Into<String>, attrs: AttrData) -> Self {
        Toi {
            id,
            class: class.into(),
            attrs,
            modified: HashMap::new(),
            deleted: false,
            phantom: false,
        }
    }

    /// Reads the current value, distinguishing "never fetched" (`None`)
    /// from "fetched empty" (`Some(&[])`).
    pub fn get(&self, attr: &str) -> Option<&[Value]> {
        self.attrs.get(attr).map(|v| v.as_slice())
    }

    /// Stages a new value for `attr`, capturing the prior value as the
    /// modification baseline the first time this attribute is touched in
    /// this context.
    pub fn stage(&mut self, attr: &str, new_value: Vec<Value>) {
        if !self.modified.contains_key(attr) {
            let baseline = self.attrs.get(attr).cloned().unwrap_or_default();
            self.modified.insert(attr.to_string(), baseline);
        }
        self.attrs.insert(attr.to_string(), new_value);
    }

    pub fn is_modified(&self, attr: &str) -> bool {
        self.modified.contains_key(attr)
    }

    pub fn modified_attrs(&self) -> impl Iterator<Item = &String> {
        self.modified.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_enough_to_sort_by_creation() {
        let a = ToiId::generate([1, 2, 3, 4, 5]);
        let b = ToiId::generate([1, 2, 3, 4, 5]);
        assert!(a <= b);
    }

    #[test]
    fn stage_captures_baseline_once() {
        let mut t = Toi::from_committed(
            ToiId::generate([0; 5]),
            "Test",
            HashMap::from_iter([("name".to_string(), vec![Value::String("foo".into())])]),
        );
        t.stage("name", vec![Value::String("bar".into())]);
        t.stage("name", vec![Value::String("baz".into())]);
        assert_eq!(
            t.modified.get("name").unwrap(),
            &vec![Value::String("foo".into())]
        );
        assert_eq!(t.get("name").unwrap(), &[Value::String("baz".into())]);
    }
}
