//! The object model: classes form a single-rooted tree; subclasses inherit
//! the union of ancestor attributes and methods, overriding (not silently
//! extending) whatever a descendant redeclares.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::instance::Toi;
use crate::restriction::{Quantity, Restriction};
use crate::value::{ElementKind, Value};

/// Properties a descriptor can carry; several interact with the commit
/// engine's validation order (read-only/unchangeable/reorder-only) and with
/// relation fix-up (unique/weak).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrProperties {
    pub read_only: bool,
    pub reorder_only: bool,
    pub unchangeable: bool,
    pub unique: bool,
    pub weak: bool,
    pub parent: bool,
    pub presentation: bool,
    pub message_id: bool,
}

/// A hook invoked on an attribute or on the whole instance around
/// create/update/delete. Hooks see only the instance being mutated — they
/// do not reach into the surrounding commit context, keeping schema code
/// free of engine internals.
pub type Hook = Arc<dyn Fn(&mut Toi) -> Result<()> + Send + Sync>;

/// A class method's body. Receives the instance it was called on (`None`
/// for a module-level `CallBlm`) and the already-coerced argument list.
pub type MethodHandler = Arc<dyn Fn(Option<&Toi>, &[Vec<Value>]) -> Result<Vec<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct AttributeDescriptor {
    pub name: String,
    pub kind: ElementKind,
    pub is_map: bool,
    pub quantity: Quantity,
    pub restrictions: Vec<Restriction>,
    pub properties: AttrProperties,
    /// For relation attributes: `"Module.Class.attr"` of the counterpart.
    /// `None` means the counterpart is discovered at runtime (§12).
    pub related: Option<String>,
    pub computed: bool,
    pub on_create: Option<Hook>,
    pub on_update: Option<Hook>,
}

impl std::fmt::Debug for AttributeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("is_map", &self.is_map)
            .field("properties", &self.properties)
            .field("related", &self.related)
            .finish()
    }
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        AttributeDescriptor {
            name: name.into(),
            kind,
            is_map: false,
            quantity: Quantity::default(),
            restrictions: Vec::new(),
            properties: AttrProperties::default(),
            related: None,
            computed: false,
            on_create: None,
            on_update: None,
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.kind, ElementKind::ToiRef { .. })
    }

    /// Default element sequence for an attribute absent from supplied data.
    pub fn default_value(&self) -> Vec<Value> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ElementKind>,
    pub rtype: Option<ElementKind>,
    pub handler: MethodHandler,
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// A schema type ("class"/"TO" in the source vocabulary). Attribute and
/// method maps are ordered (insertion order is declaration order), which
/// matters for `findRelatedAttr`'s first-match-in-declaration-order rule.
#[derive(Debug, Clone)]
pub struct Class {
    pub fullname: String,
    pub parent: Option<String>,
    /// `[self.fullname, ...ancestors]`, closest-first; stored verbatim on
    /// every instance as `_bases`.
    pub bases: Vec<String>,
    pub attributes: Vec<AttributeDescriptor>,
    pub methods: Vec<MethodDescriptor>,
    pub on_create: Option<Hook>,
    pub on_update: Option<Hook>,
    pub on_delete: Option<Hook>,
}

impl Class {
    pub fn root(fullname: impl Into<String>) -> Self {
        let fullname = fullname.into();
        Class {
            bases: vec![fullname.clone()],
            fullname,
            parent: None,
            attributes: vec![Self::implicit_allow_read()],
            methods: Vec::new(),
            on_create: None,
            on_update: None,
            on_delete: None,
        }
    }

    /// Every class carries this attribute whether or not a schema module
    /// declares it (§3): a set of access-holder references. Readability is
    /// `user is super OR user.privileges ∩ instance.allowRead ≠ ∅`.
    fn implicit_allow_read() -> AttributeDescriptor {
        AttributeDescriptor::new("allowRead", ElementKind::String)
    }

    /// Builds a subclass by copying every inherited attribute/method
    /// descriptor into a fresh per-class table (descriptor copy-on-inherit),
    /// then letting `attributes`/`methods` supplied here override by name.
    pub fn extend(
        parent: &Class,
        fullname: impl Into<String>,
        overrides: Vec<AttributeDescriptor>,
        extra_methods: Vec<MethodDescriptor>,
    ) -> Self {
        let fullname = fullname.into();
        let mut attributes: Vec<AttributeDescriptor> = parent.attributes.clone();
        for over in overrides {
            if let Some(slot) = attributes.iter_mut().find(|a| a.name == over.name) {
                *slot = over;
            } else {
                attributes.push(over);
            }
        }
        let mut methods: Vec<MethodDescriptor> = parent.methods.clone();
        for m in extra_methods {
            if let Some(slot) = methods.iter_mut().find(|existing| existing.name == m.name) {
                *slot = m;
            } else {
                methods.push(m);
            }
        }
        let mut bases = vec![fullname.clone()];
        bases.extend(parent.bases.clone());
        Class {
            fullname,
            parent: Some(parent.fullname.clone()),
            bases,
            attributes,
            methods,
            on_create: parent.on_create.clone(),
            on_update: parent.on_update.clone(),
            on_delete: parent.on_delete.clone(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn require_attribute(&self, name: &str) -> Result<&AttributeDescriptor> {
        self.attribute(name).ok_or_else(|| Error::AttrNameUnknown {
            class: self.fullname.clone(),
            name: name.to_string(),
        })
    }

    /// Every relation attribute declared on this class.
    pub fn relation_attrs(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes.iter().filter(|a| a.is_relation())
    }
}

/// Materialised default attribute data for a fresh instance of this class:
/// every declared attribute defaults to an empty sequence unless computed.
pub fn default_attrs(class: &Class) -> BTreeMap<String, Vec<Value>> {
    class
        .attributes
        .iter()
        .filter(|a| !a.computed)
        .map(|a| (a.name.clone(), a.default_value()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_carries_the_implicit_allow_read_attribute() {
        let person = Class::root("demo.Person");
        assert!(person.attribute("allowRead").is_some());
        assert_eq!(person.bases, vec!["demo.Person".to_string()]);
    }

    #[test]
    fn extend_overrides_by_name_and_keeps_the_rest() {
        let mut base = Class::root("demo.Animal");
        base.attributes.push(AttributeDescriptor::new("name", ElementKind::String));
        base.attributes.push(AttributeDescriptor::new("legs", ElementKind::Int));

        let mut legs_override = AttributeDescriptor::new("legs", ElementKind::Int);
        legs_override.quantity = Quantity { min: 4, max: Some(4) };
        let dog = Class::extend(&base, "demo.Dog", vec![legs_override], vec![]);

        assert_eq!(dog.bases, vec!["demo.Dog".to_string(), "demo.Animal".to_string()]);
        assert!(dog.attribute("name").is_some(), "unrelated inherited attribute survives");
        assert_eq!(dog.attribute("legs").unwrap().quantity.max, Some(4));
        assert!(dog.attribute("allowRead").is_some(), "implicit attribute is inherited too");
    }

    #[test]
    fn require_attribute_reports_attr_name_unknown() {
        let person = Class::root("demo.Person");
        let err = person.require_attribute("nope").unwrap_err();
        assert!(matches!(err, Error::AttrNameUnknown { .. }));
    }

    #[test]
    fn default_attrs_skips_computed_attributes() {
        let mut class = Class::root("demo.Thing");
        class.attributes.push(AttributeDescriptor::new("label", ElementKind::String));
        let mut computed = AttributeDescriptor::new("derived", ElementKind::Int);
        computed.computed = true;
        class.attributes.push(computed);

        let defaults = default_attrs(&class);
        assert!(defaults.contains_key("label"));
        assert!(!defaults.contains_key("derived"));
    }
}
