//! Per-instance attribute diffs (`DiffToi`) and sequence diff-opcodes.
//!
//! `DiffToi` serves two purposes: the commit engine's conflict-detection
//! baseline (`org_attrs` compared against the freshly reloaded store value)
//! and the link engine's client-facing change payload (`diff_attrs`
//! delivered to subscribers). Diff-opcodes drive the sorted-query link's
//! incremental reorder payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::class::Class;
use crate::instance::{AttrData, Toi, ToiId};
use crate::value::Value;

/// `{id, class, changedAttrs, baselineAttrs}` — a record of what changed
/// on one instance, used both for conflict detection and client updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffToi {
    pub toid: ToiId,
    pub toc_fullname: String,
    /// Attribute → new value, for every attribute that actually changed.
    pub diff_attrs: AttrData,
    /// Attribute → prior value, same key set as `diff_attrs`.
    pub org_attrs: AttrData,
}

impl DiffToi {
    pub fn forget(&mut self, attr: &str) {
        self.diff_attrs.remove(attr);
        self.org_attrs.remove(attr);
    }

    pub fn update(&mut self, other: &DiffToi) {
        for (k, v) in &other.diff_attrs {
            self.diff_attrs.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.org_attrs {
            self.org_attrs.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.diff_attrs.is_empty()
    }

    /// Builds a diff covering every class attribute present in `old_attrs`
    /// against `new_attrs`, populating `diff_attrs`/`org_attrs` only for
    /// attributes whose value actually changed — the mechanism behind
    /// commit idempotence on a no-op `ChangeToi` (§8 property 6).
    pub fn set_diff(class: &Class, toid: ToiId, old_attrs: &AttrData, new_attrs: &AttrData) -> Self {
        let mut diff = DiffToi { toid, toc_fullname: class.fullname.clone(), diff_attrs: AttrData::new(), org_attrs: AttrData::new() };
        for attr in &class.attributes {
            let Some(new_value) = new_attrs.get(&attr.name) else { continue };
            let old_value = old_attrs.get(&attr.name).cloned().unwrap_or_default();
            if new_value != &old_value {
                diff.diff_attrs.insert(attr.name.clone(), new_value.clone());
                diff.org_attrs.insert(attr.name.clone(), old_value);
            }
        }
        diff
    }

    /// Builds a diff from a toi's own staged modifications.
    pub fn from_toi(class: &Class, toi: &Toi) -> Self {
        let mut diff = DiffToi {
            toid: toi.id,
            toc_fullname: class.fullname.clone(),
            diff_attrs: AttrData::new(),
            org_attrs: AttrData::new(),
        };
        for attr in toi.modified_attrs() {
            if let Some(new_value) = toi.attrs.get(attr) {
                diff.diff_attrs.insert(attr.clone(), new_value.clone());
            }
            if let Some(old_value) = toi.modified.get(attr) {
                diff.org_attrs.insert(attr.clone(), old_value.clone());
            }
        }
        diff
    }

    /// Compares each `org_attrs` baseline value against the current value
    /// on a freshly reloaded instance; returns the attributes that no
    /// longer match — the conflict-detection check the commit engine's
    /// persistence step runs before its bulk write.
    pub fn diffs_old(&self, reloaded: &AttrData) -> BTreeMap<String, Vec<Value>> {
        let mut mismatches = BTreeMap::new();
        for (attr, baseline) in &self.org_attrs {
            let current = reloaded.get(attr).cloned().unwrap_or_default();
            if &current != baseline {
                mismatches.insert(attr.clone(), current);
            }
        }
        mismatches
    }
}

/// One diff-opcode: replace the half-open range `[start, end)` of the old
/// sequence with `replacement`. Equal runs are omitted (no opcode emitted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opcode<T> {
    pub start: usize,
    pub end: usize,
    pub replacement: Vec<T>,
}

/// Longest-common-subsequence based diff: walks an LCS table then emits
/// opcodes for the non-matching runs between matches, mirroring
/// `difflib.SequenceMatcher.get_opcodes()` with `'equal'` ops dropped.
pub fn diff_opcodes<T: PartialEq + Clone>(old: &[T], new: &[T]) -> Vec<Opcode<T>> {
    let matches = lcs_matches(old, new);
    let mut opcodes = Vec::new();
    let (mut oi, mut ni) = (0usize, 0usize);
    for (mo, mn, len) in matches {
        if mo > oi || mn > ni {
            opcodes.push(Opcode { start: oi, end: mo, replacement: new[ni..mn].to_vec() });
        }
        oi = mo + len;
        ni = mn + len;
    }
    if oi < old.len() || ni < new.len() {
        opcodes.push(Opcode { start: oi, end: old.len(), replacement: new[ni..].to_vec() });
    }
    opcodes
}

/// Matching runs `(old_start, new_start, length)` found via a classic
/// O(n*m) LCS dynamic-programming table — adequate for the small per-link
/// result sets this diff runs over; not intended for large-sequence use.
fn lcs_matches<T: PartialEq>(old: &[T], new: &[T]) -> Vec<(usize, usize, usize)> {
    let (n, m) = (old.len(), new.len());
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if old[i] == new[j] { table[i + 1][j + 1] + 1 } else { table[i + 1][j].max(table[i][j + 1]) };
        }
    }
    let mut runs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            let (start_i, start_j) = (i, j);
            let mut len = 0;
            while i < n && j < m && old[i] == new[j] {
                i += 1;
                j += 1;
                len += 1;
            }
            runs.push((start_i, start_j, len));
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    runs
}

/// Applies opcodes in left-to-right order, tracking the running length
/// offset each replacement introduces, reconstructing `new` from `old`.
pub fn apply_opcodes<T: Clone>(old: &[T], opcodes: &[Opcode<T>]) -> Vec<T> {
    let mut out = Vec::new();
    let mut cursor = 0;
    for op in opcodes {
        out.extend_from_slice(&old[cursor..op.start]);
        out.extend(op.replacement.iter().cloned());
        cursor = op.end;
    }
    out.extend_from_slice(&old[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn apply_reconstructs_new_from_old() {
        let old = vec![1, 2, 3, 4, 5];
        let new = vec![1, 9, 3, 4, 7, 8];
        let ops = diff_opcodes(&old, &new);
        assert_eq!(apply_opcodes(&old, &ops), new);
    }

    #[test]
    fn no_change_yields_no_opcodes() {
        let seq = vec!["a", "b", "c"];
        assert!(diff_opcodes(&seq, &seq).is_empty());
    }

    #[test]
    fn single_insertion_detected() {
        let old = vec![1, 2, 3];
        let new = vec![1, 2, 9, 3];
        let ops = diff_opcodes(&old, &new);
        assert_eq!(ops, vec![Opcode { start: 2, end: 2, replacement: vec![9] }]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// §8 property 5: `apply(diff(A, B), A) = B` for arbitrary sequences.
        #[test]
        fn diff_opcode_law_holds_for_arbitrary_sequences(
            old in proptest::collection::vec(0i32..20, 0..20),
            new in proptest::collection::vec(0i32..20, 0..20),
        ) {
            let ops = diff_opcodes(&old, &new);
            prop_assert_eq!(apply_opcodes(&old, &ops), new);
        }
    }
}
