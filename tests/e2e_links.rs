//! End-to-end link-engine scenarios (S5, plus `Request`/`CallMethod`
//! delivery), exercised purely through the crate's public API.

use std::sync::Arc;

use pytransact::links::CallTarget;
use pytransact::{
    AttrData, AttributeDescriptor, BlobRefManager, Class, CommitEngine, ConditionGroup,
    ElementKind, Link, LinkEngine, LinkKind, LinkUpdate, MemoryBackend, MemoryBlobBackend,
    MethodDescriptor, NullTextIndexer, Operation, Operator, Query, Result, SchemaModule,
    SchemaRegistry, ToiId, Value,
};

struct TestModule;

impl SchemaModule for TestModule {
    fn name(&self) -> &str {
        "test"
    }

    fn register_classes(&self, registry: &mut SchemaRegistry) -> Result<()> {
        let mut item = Class::root("test.Item");
        item.attributes.push(AttributeDescriptor::new("score", ElementKind::Int));
        item.attributes.push(AttributeDescriptor::new("active", ElementKind::Bool));
        item.methods.push(MethodDescriptor {
            name: "doubleScore".into(),
            params: vec![],
            rtype: Some(ElementKind::Int),
            handler: Arc::new(|toi, _args| {
                let toi = toi.expect("doubleScore is called on an instance");
                let score = toi.get("score").and_then(|v| v.first()).and_then(|v| v.as_int()).unwrap_or(0);
                Ok(vec![Value::Int(score * 2)])
            }),
        });
        registry.register(item);
        Ok(())
    }
}

fn setup() -> (Arc<CommitEngine>, LinkEngine, Arc<MemoryBackend>) {
    let mut reg = SchemaRegistry::new();
    reg.load(&[&TestModule]).unwrap();
    let registry = Arc::new(reg);
    let store = Arc::new(MemoryBackend::new());
    let blobs = Arc::new(BlobRefManager::new(Arc::new(MemoryBlobBackend::default())));
    let commit_engine = Arc::new(CommitEngine::new(registry.clone(), store.clone(), blobs, Arc::new(NullTextIndexer)));
    let link_engine = LinkEngine::new(registry, store.clone(), commit_engine.clone());
    (commit_engine, link_engine, store)
}

fn attrs(pairs: &[(&str, Vec<Value>)]) -> AttrData {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// S5 — a sorted-query link's cached result reorders incrementally when
/// a new matching instance is committed.
#[tokio::test]
async fn s5_sorted_query_incremental_update() {
    let (commit_engine, link_engine, _store) = setup();
    let id1 = ToiId::generate([1; 5]);
    let id2 = ToiId::generate([2; 5]);

    commit_engine
        .commit(
            vec![],
            true,
            "c1",
            vec![Operation::CreateToi {
                class: "test.Item".into(),
                id: id1,
                attrs: attrs(&[("score", vec![Value::Int(10)]), ("active", vec![Value::Bool(true)])]),
            }],
        )
        .await;

    let query = Query::new("test.Item").push(ConditionGroup::new().with("active", Operator::In(vec![Value::Bool(true)])));
    let mut link = Link::new("link-1", LinkKind::SortedQuery { query, sort_attr: "score".into(), descending: false }, vec![], true);
    let initial = link_engine.run(&mut link).await.unwrap();
    assert_eq!(initial, LinkUpdate::ResultSet(vec![id1]));

    let record = commit_engine
        .commit(
            vec![],
            true,
            "c2",
            vec![Operation::CreateToi {
                class: "test.Item".into(),
                id: id2,
                attrs: attrs(&[("score", vec![Value::Int(5)]), ("active", vec![Value::Bool(true)])]),
            }],
        )
        .await;

    let mut links = vec![link];
    let updates = link_engine.notify_changes(&mut links, &record).await;
    assert_eq!(updates.len(), 1);
    match &updates[0].1 {
        LinkUpdate::Reorder(ops) => assert!(!ops.is_empty()),
        other => panic!("expected a reorder update, got {other:?}"),
    }
    assert_eq!(links[0].last_result.as_deref(), Some(&[id2, id1][..]));
}

/// A request link only reports instance data the subscriber's privileges
/// can actually read.
#[tokio::test]
async fn request_link_hides_unreadable_instance() {
    let (commit_engine, link_engine, _store) = setup();
    let id = ToiId::generate([3; 5]);
    commit_engine
        .commit(
            vec![],
            true,
            "c1",
            vec![Operation::CreateToi { class: "test.Item".into(), id, attrs: attrs(&[("score", vec![Value::Int(1)])]) }],
        )
        .await;

    let mut link = Link::new("link-2", LinkKind::Request { toid: id, attrs: vec!["score".into()] }, vec![Value::String("group-a".into())], false);
    let update = link_engine.run(&mut link).await.unwrap();
    match update {
        LinkUpdate::Instance { attrs, .. } => assert!(attrs.is_empty()),
        other => panic!("expected an instance update, got {other:?}"),
    }
}

/// A `CallMethod` link stages its call as a real commit and delivers the
/// method's return value as the one-shot payload.
#[tokio::test]
async fn call_method_link_runs_through_commit_engine() {
    let (commit_engine, link_engine, _store) = setup();
    let id = ToiId::generate([4; 5]);
    commit_engine
        .commit(
            vec![],
            true,
            "c1",
            vec![Operation::CreateToi { class: "test.Item".into(), id, attrs: attrs(&[("score", vec![Value::Int(21)])]) }],
        )
        .await;

    let mut link = Link::new(
        "link-3",
        LinkKind::CallMethod { target: CallTarget::Instance(id), method: "doubleScore".into(), args: vec![] },
        vec![],
        true,
    );
    let update = link_engine.run(&mut link).await.unwrap();
    assert_eq!(update, LinkUpdate::MethodResult { result: vec![Value::Int(42)], error: None });
}

/// A failing method call surfaces its error through the payload rather
/// than propagating as a `Result` error.
#[tokio::test]
async fn call_method_link_reports_error_on_unknown_method() {
    let (commit_engine, link_engine, _store) = setup();
    let id = ToiId::generate([5; 5]);
    commit_engine
        .commit(vec![], true, "c1", vec![Operation::CreateToi { class: "test.Item".into(), id, attrs: AttrData::new() }])
        .await;

    let mut link = Link::new(
        "link-4",
        LinkKind::CallMethod { target: CallTarget::Instance(id), method: "noSuchMethod".into(), args: vec![] },
        vec![],
        true,
    );
    let update = link_engine.run(&mut link).await.unwrap();
    match update {
        LinkUpdate::MethodResult { result, error: Some(_) } => assert!(result.is_empty()),
        other => panic!("expected an error payload, got {other:?}"),
    }
}
