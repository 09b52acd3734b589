//! End-to-end commit-engine scenarios, exercised purely through the
//! crate's public API (S1-S3, lock discipline). The S6 blob-refcount
//! scenario stays alongside `CommitEngine`'s private staging methods in
//! `src/commit.rs`, since it drives `change_toi`/`fixup_blob_refs`/`persist`
//! directly to observe a single failed generation rather than the
//! commit()-wrapper's retry-to-success behavior.

use std::sync::Arc;

use pytransact::{
    AttrData, AttrProperties, AttributeDescriptor, BlobRefManager, Class, CommitEngine,
    CommitState, ElementKind, MemoryBackend, MemoryBlobBackend, NullTextIndexer, Operation,
    Quantity, Result, SchemaModule, SchemaRegistry, ToiId, Value,
};

struct TestModule;

impl SchemaModule for TestModule {
    fn name(&self) -> &str {
        "test"
    }

    fn register_classes(&self, registry: &mut SchemaRegistry) -> Result<()> {
        let mut test = Class::root("test.Test");
        let mut name_attr = AttributeDescriptor::new("name", ElementKind::String);
        name_attr.quantity = Quantity { min: 0, max: Some(1) };
        test.attributes.push(name_attr);
        let mut unique_attr = AttributeDescriptor::new("u", ElementKind::String);
        unique_attr.properties = AttrProperties { unique: true, ..Default::default() };
        test.attributes.push(unique_attr);
        registry.register(test);

        let mut a = Class::root("test.A");
        a.attributes.push(AttributeDescriptor::new("bs", ElementKind::ToiRef { class: "test.B".into() }));
        let mut b = Class::root("test.B");
        b.attributes.push(AttributeDescriptor::new("a", ElementKind::ToiRef { class: "test.A".into() }));
        registry.register(a);
        registry.register(b);
        registry.defer_relation("test.A", "bs", "test.B.a");
        registry.defer_relation("test.B", "a", "test.A.bs");
        Ok(())
    }
}

fn test_engine() -> (CommitEngine, Arc<MemoryBackend>) {
    let mut reg = SchemaRegistry::new();
    reg.load(&[&TestModule]).unwrap();
    let registry = Arc::new(reg);
    let store = Arc::new(MemoryBackend::new());
    let blobs = Arc::new(BlobRefManager::new(Arc::new(MemoryBlobBackend::default())));
    (CommitEngine::new(registry, store.clone(), blobs, Arc::new(NullTextIndexer)), store)
}

fn attrs(pairs: &[(&str, Vec<Value>)]) -> AttrData {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// S1 — create/query/delete round-trip.
#[tokio::test]
async fn s1_create_query_delete_round_trip() {
    let (engine, store) = test_engine();
    let id = ToiId::generate([0; 5]);
    let record = engine
        .commit(
            vec![],
            true,
            "c1",
            vec![Operation::CreateToi {
                class: "test.Test".into(),
                id,
                attrs: attrs(&[("name", vec![Value::String("foo".into())])]),
            }],
        )
        .await;
    assert_eq!(record.state, CommitState::Done);
    let doc = store.find_one(id).await.unwrap().unwrap();
    assert_eq!(doc.attrs.get("name").unwrap(), &vec![Value::String("foo".into())]);

    let record = engine.commit(vec![], true, "c2", vec![Operation::DeleteToi { id }]).await;
    assert_eq!(record.state, CommitState::Done);
    assert!(store.find_one(id).await.unwrap().is_none());
}

/// S2 — relation symmetry: creating `B.a -> A` populates `A.bs` in
/// reverse, and clearing it retracts the reverse edge too.
#[tokio::test]
async fn s2_relation_symmetry() {
    let (engine, store) = test_engine();
    let a1 = ToiId::generate([1; 5]);
    let b1 = ToiId::generate([2; 5]);

    engine
        .commit(vec![], true, "c1", vec![Operation::CreateToi { class: "test.A".into(), id: a1, attrs: AttrData::new() }])
        .await;
    let record = engine
        .commit(
            vec![],
            true,
            "c2",
            vec![Operation::CreateToi {
                class: "test.B".into(),
                id: b1,
                attrs: attrs(&[("a", vec![Value::ToiRef(a1)])]),
            }],
        )
        .await;
    assert_eq!(record.state, CommitState::Done);

    let a_doc = store.find_one(a1).await.unwrap().unwrap();
    assert_eq!(a_doc.attrs.get("bs").unwrap(), &vec![Value::ToiRef(b1)]);

    let record = engine
        .commit(vec![], true, "c3", vec![Operation::ChangeToi { id: b1, attrs: attrs(&[("a", vec![])]) }])
        .await;
    assert_eq!(record.state, CommitState::Done);
    let a_doc = store.find_one(a1).await.unwrap().unwrap();
    assert!(a_doc.attrs.get("bs").unwrap().is_empty());
}

/// S3 — unique conflict: the second create of a colliding value fails.
#[tokio::test]
async fn s3_unique_conflict() {
    let (engine, _store) = test_engine();
    let id1 = ToiId::generate([3; 5]);
    let id2 = ToiId::generate([4; 5]);

    let r1 = engine
        .commit(
            vec![],
            true,
            "c1",
            vec![Operation::CreateToi { class: "test.Test".into(), id: id1, attrs: attrs(&[("u", vec![Value::String("X".into())])]) }],
        )
        .await;
    assert_eq!(r1.state, CommitState::Done);

    let r2 = engine
        .commit(
            vec![],
            true,
            "c2",
            vec![Operation::CreateToi { class: "test.Test".into(), id: id2, attrs: attrs(&[("u", vec![Value::String("X".into())])]) }],
        )
        .await;
    assert_eq!(r2.state, CommitState::Failed);
    assert!(r2.error.unwrap().contains("unique"));
}

/// Lock discipline (§8 property 9): no document is left locked after
/// any commit attempt, success or failure.
#[tokio::test]
async fn lock_discipline_holds_after_conflict() {
    let (engine, store) = test_engine();
    let id = ToiId::generate([6; 5]);
    engine
        .commit(vec![], true, "c1", vec![Operation::CreateToi { class: "test.Test".into(), id, attrs: AttrData::new() }])
        .await;
    engine
        .commit(vec![], true, "c2", vec![Operation::ChangeToi { id, attrs: attrs(&[("name", vec![Value::String("a".into())])]) }])
        .await;
    let doc = store.find_one(id).await.unwrap().unwrap();
    assert!(doc.handled_by.is_none());
}
