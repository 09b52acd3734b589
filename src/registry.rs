//! Schema registry: module → class map, relation closure resolution, and
//! the schema-module loader seam.
//!
//! Modules register classes eagerly; string-named relation counterparts
//! (`"Module.Class.attr"`) are resolved in a second pass once every module
//! in the batch has loaded, so cyclic module references work the same way
//! they do in the source system.

use std::collections::BTreeMap;

use crate::class::{Class, MethodDescriptor};
use crate::error::{Error, Result};

/// A schema module: a Rust value that registers its classes into the
/// registry. No dynamic loading — modules are just values constructed and
/// passed to [`SchemaRegistry::load`].
pub trait SchemaModule {
    fn name(&self) -> &str;
    fn register_classes(&self, registry: &mut SchemaRegistry) -> Result<()>;
}

#[derive(Default)]
pub struct SchemaRegistry {
    classes: BTreeMap<String, Class>,
    /// Deferred `(class, attr) -> "Module.Class.attr"` links collected
    /// during `register_classes`, resolved by `resolve_relations`.
    pending_relations: Vec<(String, String, String)>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: Class) {
        self.classes.insert(class.fullname.clone(), class);
    }

    /// Defers resolution of a string-named relation counterpart until all
    /// modules in the batch have registered (handles cyclic references).
    pub fn defer_relation(&mut self, class: impl Into<String>, attr: impl Into<String>, target: impl Into<String>) {
        self.pending_relations.push((class.into(), attr.into(), target.into()));
    }

    pub fn class(&self, fullname: &str) -> Option<&Class> {
        self.classes.get(fullname)
    }

    pub fn require_class(&self, fullname: &str) -> Result<&Class> {
        self.class(fullname).ok_or_else(|| Error::Internal(format!("unknown class {fullname}")))
    }

    /// Loads a batch of modules: each registers its classes and defers its
    /// relation links, then the whole batch's relations are resolved
    /// together so forward/cyclic references across modules work.
    pub fn load(&mut self, modules: &[&dyn SchemaModule]) -> Result<()> {
        for module in modules {
            module.register_classes(self)?;
        }
        self.resolve_relations()
    }

    /// Validates every deferred relation: the named counterpart attribute
    /// must exist and must itself be a relation pointing back at the
    /// originating class. Fails schema setup otherwise (§4.9).
    fn resolve_relations(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_relations);
        for (class, attr, target) in &pending {
            let (target_class, target_attr) = split_related(target)?;
            let peer = self.require_class(&target_class)?;
            let peer_attr = peer.attribute(&target_attr).ok_or_else(|| {
                Error::RelationError { class: class.clone(), attr: attr.clone() }
            })?;
            if !peer_attr.is_relation() {
                return Err(Error::RelationError { class: class.clone(), attr: attr.clone() });
            }
            let class_entry = self.classes.get_mut(class).ok_or_else(|| Error::Internal(format!("unknown class {class}")))?;
            if let Some(a) = class_entry.attributes.iter_mut().find(|a| a.name == *attr) {
                a.related = Some(target.clone());
            }
        }
        Ok(())
    }

    /// Runtime counterpart discovery for relations whose `related` is
    /// unspecified: the unique relation attribute on the peer whose
    /// element type matches the origin class, first match in
    /// declaration order (§12 — ambiguity is intentionally unresolved
    /// beyond "first wins", matching the source's behaviour).
    pub fn find_related_attr(&self, peer_class: &str, origin_class: &str) -> Result<String> {
        let peer = self.require_class(peer_class)?;
        peer.relation_attrs()
            .find(|a| matches!(&a.kind, crate::value::ElementKind::ToiRef { class } if class == origin_class))
            .map(|a| a.name.clone())
            .ok_or_else(|| Error::RelationError {
                class: peer_class.to_string(),
                attr: format!("<inferred from {origin_class}>"),
            })
    }

    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.values()
    }
}

fn split_related(path: &str) -> Result<(String, String)> {
    let mut parts = path.rsplitn(2, '.');
    let attr = parts.next().ok_or_else(|| Error::Internal(format!("malformed relation path {path}")))?;
    let class = parts.next().ok_or_else(|| Error::Internal(format!("malformed relation path {path}")))?;
    Ok((class.to_string(), attr.to_string()))
}
