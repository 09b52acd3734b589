//! The text-indexing seam: term extraction is an external collaborator
//! (§1 Non-goals), consumed here only through the narrow interface the
//! commit engine needs to keep the "index emission" step in its pipeline.
//!
//! `saveIndexData` in the source returns `[]` unconditionally — the seam is
//! present but the text indexer is effectively disabled. [`NullTextIndexer`]
//! preserves that literally: it accepts terms and always reports none,
//! which is also why `Operator::Fulltext` never matches (see `query/ops.rs`).

use crate::instance::ToiId;

/// Extracts searchable terms for an instance's owner id, and (at query time)
/// resolves a fulltext search term to the set of owner ids it matches.
pub trait TextIndexer: Send + Sync {
    /// Called once per committed instance whose class declares indexed
    /// attributes; returns the terms to associate with `owner`.
    fn extract_terms(&self, owner: ToiId, attrs: &crate::instance::AttrData) -> Vec<String>;

    /// Resolves a `Fulltext` query term to matching owner ids. A store with
    /// no working index (the default) always returns an empty set.
    fn search(&self, term: &str) -> Vec<ToiId>;
}

/// The default: present but disabled, matching the source's `saveIndexData`.
#[derive(Default)]
pub struct NullTextIndexer;

impl TextIndexer for NullTextIndexer {
    fn extract_terms(&self, _owner: ToiId, _attrs: &crate::instance::AttrData) -> Vec<String> {
        Vec::new()
    }

    fn search(&self, _term: &str) -> Vec<ToiId> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::AttrData;

    #[test]
    fn null_indexer_extracts_nothing_and_matches_nothing() {
        let indexer = NullTextIndexer;
        let owner = ToiId::generate([9; 5]);
        assert!(indexer.extract_terms(owner, &AttrData::new()).is_empty());
        assert!(indexer.search("anything").is_empty());
    }
}
