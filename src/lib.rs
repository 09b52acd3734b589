//! # pytransact — a transactional object layer over a pluggable document store
//!
//! Typed classes with inherited attributes, optimistic-concurrency commits,
//! bidirectional relations maintained automatically, and subscription links
//! that re-run when a commit touches data they watch.
//!
//! ## Layout
//!
//! - [`value`] / [`restriction`] — the element-kind value model and its
//!   per-element/whole-sequence validators.
//! - [`class`] / [`instance`] — class descriptors (attributes, methods,
//!   hooks) and the `Toi` instance they describe.
//! - [`registry`] — the schema registry modules load their classes into.
//! - [`context`] — the read/commit context stack instances are loaded and
//!   staged through.
//! - [`query`] — the condition-group/query model, matched in-process or
//!   translated to a document-store predicate.
//! - [`storage`] — the [`storage::StorageBackend`] trait and its in-memory
//!   reference implementation.
//! - [`blob`] — externalised large-value storage with reference counting.
//! - [`textindex`] — the fulltext-indexing seam (disabled by default).
//! - [`commit`] — the commit engine: staging, validation, relation fix-up,
//!   locking, persistence and conflict/lock retry.
//! - [`links`] — the subscription/link engine built on top of commits.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pytransact::class::{AttributeDescriptor, Class};
//! use pytransact::commit::{CommitEngine, Operation};
//! use pytransact::instance::{AttrData, ToiId};
//! use pytransact::registry::{SchemaModule, SchemaRegistry};
//! use pytransact::storage::MemoryBackend;
//! use pytransact::blob::{BlobRefManager, MemoryBlobBackend};
//! use pytransact::textindex::NullTextIndexer;
//! use pytransact::value::{ElementKind, Value};
//! use std::sync::Arc;
//!
//! struct Demo;
//! impl SchemaModule for Demo {
//!     fn name(&self) -> &str { "demo" }
//!     fn register_classes(&self, registry: &mut SchemaRegistry) -> pytransact::error::Result<()> {
//!         let mut person = Class::root("demo.Person");
//!         person.attributes.push(AttributeDescriptor::new("name", ElementKind::String));
//!         registry.register(person);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> pytransact::error::Result<()> {
//! let mut reg = SchemaRegistry::new();
//! reg.load(&[&Demo])?;
//! let registry = Arc::new(reg);
//! let store = Arc::new(MemoryBackend::new());
//! let blobs = Arc::new(BlobRefManager::new(Arc::new(MemoryBlobBackend::default())));
//! let engine = CommitEngine::new(registry, store.clone(), blobs, Arc::new(NullTextIndexer));
//!
//! let id = ToiId::generate([0; 5]);
//! let mut attrs = AttrData::new();
//! attrs.insert("name".into(), vec![Value::String("Ada".into())]);
//! let record = engine.commit(vec![], true, "c1", vec![Operation::CreateToi {
//!     class: "demo.Person".into(),
//!     id,
//!     attrs,
//! }]).await;
//! assert_eq!(record.state, pytransact::commit::CommitState::Done);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod class;
pub mod commit;
pub mod context;
pub mod error;
pub mod instance;
pub mod links;
pub mod query;
pub mod registry;
pub mod restriction;
pub mod storage;
pub mod textindex;
pub mod value;

pub use blob::{BlobBackend, BlobRefManager, MemoryBlobBackend};
pub use class::{AttrProperties, AttributeDescriptor, Class, MethodDescriptor};
pub use commit::{CommitEngine, CommitRecord, CommitState, Operation, OpResult};
pub use context::{CommitContext, ReadContext};
pub use error::{Error, Result};
pub use instance::{AttrData, Toi, ToiId};
pub use links::{Link, LinkEngine, LinkKind, LinkUpdate};
pub use query::{ConditionGroup, Query};
pub use query::ops::Operator;
pub use registry::{SchemaModule, SchemaRegistry};
pub use restriction::{Quantity, Restriction};
pub use storage::{MemoryBackend, StorageBackend};
pub use textindex::{NullTextIndexer, TextIndexer};
pub use value::{ElementKind, Value};
