//! The four reference scenarios

use crate::common::*;
use std::sync::Arc;
use trellisdb::{AdaptiveLinkCollection, ConversionThresholds};

fn foo_with_ten_records() -> Arc<Database> {
    let db = open();
    class_with(&db, "Foo", &[("ai", PropertyType::Integer)]);
    index_on(&db, "Foo", "ai", PropertyType::Integer, false);
    let mut session = db.session();
    for i in 0..10i64 {
        insert(&mut session, "Foo", vec![("ai", Value::Int(i))]);
    }
    db
}

// ============================================================================
// Scenario A: closed range conjunction becomes one range scan
// ============================================================================

#[test]
fn scenario_a_closed_range_is_converted() {
    let db = foo_with_ten_records();
    let metrics = Arc::new(CountingMetrics::new());
    let session = db.session_with_metrics(metrics.clone());

    let result = session
        .query(
            "Foo",
            &Predicate::and(vec![Predicate::ge("ai", 1i64), Predicate::le("ai", 3i64)]),
        )
        .unwrap();

    assert_eq!(sorted_ints(&result.documents, "ai"), vec![1, 2, 3]);
    assert!(result.plan.range_converted);
    assert_eq!(result.plan.index.as_deref(), Some("Foo.ai"));
    assert_eq!(metrics.ranges_converted(), 1);
    assert_eq!(metrics.uses_of("Foo.ai"), 1);
    assert_eq!(metrics.full_scans(), 0);
}

#[test]
fn scenario_a_operand_order_and_nesting_do_not_matter() {
    let db = foo_with_ten_records();
    let metrics = Arc::new(CountingMetrics::new());
    let session = db.session_with_metrics(metrics.clone());

    let reversed = Predicate::and(vec![Predicate::le("ai", 3i64), Predicate::ge("ai", 1i64)]);
    let nested = Predicate::and(vec![
        Predicate::and(vec![Predicate::ge("ai", 1i64)]),
        Predicate::and(vec![Predicate::and(vec![Predicate::le("ai", 3i64)])]),
    ]);
    for predicate in [reversed, nested] {
        let result = session.query("Foo", &predicate).unwrap();
        assert_eq!(sorted_ints(&result.documents, "ai"), vec![1, 2, 3]);
        assert!(result.plan.range_converted);
    }
    assert_eq!(metrics.ranges_converted(), 2);
}

#[test]
fn scenario_a_exclusive_bounds() {
    let db = foo_with_ten_records();
    let session = db.session();
    let result = session
        .query(
            "Foo",
            &Predicate::and(vec![Predicate::gt("ai", 1i64), Predicate::lt("ai", 4i64)]),
        )
        .unwrap();
    assert_eq!(sorted_ints(&result.documents, "ai"), vec![2, 3]);
    assert!(result.plan.range_converted);
}

// ============================================================================
// Scenario B: mixed operators are not a converted range
// ============================================================================

#[test]
fn scenario_b_mixed_operators_not_reported_as_range() {
    let db = foo_with_ten_records();
    let metrics = Arc::new(CountingMetrics::new());
    let session = db.session_with_metrics(metrics.clone());

    let result = session
        .query(
            "Foo",
            &Predicate::and(vec![Predicate::ge("ai", 1i64), Predicate::eq("ai", 3i64)]),
        )
        .unwrap();

    assert_eq!(sorted_ints(&result.documents, "ai"), vec![3]);
    assert!(!result.plan.range_converted);
    assert_eq!(metrics.ranges_converted(), 0);
}

#[test]
fn scenario_b_single_bound_is_not_converted() {
    let db = foo_with_ten_records();
    let session = db.session();
    let result = session.query("Foo", &Predicate::ge("ai", 7i64)).unwrap();
    assert_eq!(sorted_ints(&result.documents, "ai"), vec![7, 8, 9]);
    assert!(!result.plan.range_converted);
    assert_eq!(result.plan.index.as_deref(), Some("Foo.ai"));
}

// ============================================================================
// Scenario C: delete and reinsert a unique key in one transaction
// ============================================================================

#[test]
fn scenario_c_reinsert_unique_key_in_one_transaction() {
    let db = open();
    class_with(&db, "Item", &[("value", PropertyType::Integer)]);
    index_on(&db, "Item", "value", PropertyType::Integer, true);

    let mut writer = db.session();
    let reader = db.session();
    writer.begin().unwrap();
    let first = insert(&mut writer, "Item", vec![("value", Value::Int(1))]);
    writer.delete(first).unwrap();
    let second = insert(&mut writer, "Item", vec![("value", Value::Int(1))]);

    // The writer sees exactly its latest record
    assert_eq!(writer.index_get("Item.value", &index_key![1i64]).unwrap(), vec![second]);

    // A concurrent reader sees no pending changes at all
    assert!(reader.index_changes("Item.value").is_none());
    assert!(reader.index_get("Item.value", &index_key![1i64]).unwrap().is_empty());
    assert!(reader.query("Item", &Predicate::eq("value", 1i64)).unwrap().is_empty());

    writer.commit().unwrap();

    let entries = reader.index_stream_all("Item.value", true).unwrap();
    assert_eq!(entries, vec![(index_key![1i64], second)]);
    assert_eq!(reader.query("Item", &Predicate::eq("value", 1i64)).unwrap().ids(), vec![second]);
}

// ============================================================================
// Scenario D: link collection edit rolled back
// ============================================================================

fn scenario_d(config: TrellisConfig) {
    let db = open_with(config);
    class_with(&db, "Target", &[]);
    class_with(&db, "Node", &[("out", PropertyType::LinkBag)]);
    db.create_index(
        IndexDefinition::builder("Node.out", "Node").field(IndexedField::new("out", PropertyType::LinkBag)),
    )
    .unwrap();

    let mut session = db.session();
    let t1 = insert(&mut session, "Target", vec![]);
    let t2 = insert(&mut session, "Target", vec![]);
    let t3 = insert(&mut session, "Target", vec![]);

    let mut node = Document::new("Node").with(
        "out",
        AdaptiveLinkCollection::from_ids([t1, t2], ConversionThresholds::default()),
    );
    let node_id = session.save(&mut node).unwrap();
    let pages_before = db.pages().page_count();

    session.begin().unwrap();
    let mut doc = session.load(node_id).unwrap();
    {
        let pages = db.pages().as_ref();
        let bag = doc.link_bag_mut("out").unwrap();
        assert!(bag.remove(t1, pages).unwrap());
        bag.add(t3);
    }
    session.save(&mut doc).unwrap();
    assert_eq!(session.index_get("Node.out", &index_key![t3]).unwrap(), vec![node_id]);
    assert!(session.index_get("Node.out", &index_key![t1]).unwrap().is_empty());
    session.rollback().unwrap();

    let reloaded = session.load(node_id).unwrap();
    let bag = reloaded.get("out").as_link_bag().unwrap();
    assert_eq!(bag.to_sorted_vec(db.pages().as_ref()).unwrap(), vec![t1, t2]);
    assert_eq!(session.index_get("Node.out", &index_key![t1]).unwrap(), vec![node_id]);
    assert!(session.index_get("Node.out", &index_key![t3]).unwrap().is_empty());
    assert_eq!(db.pages().page_count(), pages_before);
}

#[test]
fn scenario_d_rollback_restores_embedded_collection() {
    scenario_d(TrellisConfig::default());
}

#[test]
fn scenario_d_rollback_restores_tree_backed_collection() {
    scenario_d(tree_threshold_config(0));
}
