//! Null handling in single and composite indexes

use crate::common::*;
use std::sync::Arc;

fn composite(ignore_null_values: bool) -> Arc<Database> {
    let db = open();
    class_with(&db, "Pair", &[("a", PropertyType::Integer), ("b", PropertyType::Integer)]);
    db.create_index(
        IndexDefinition::builder("Pair.ab", "Pair")
            .property("a", PropertyType::Integer)
            .property("b", PropertyType::Integer)
            .ignore_null_values(ignore_null_values),
    )
    .unwrap();
    db
}

#[test]
fn trailing_null_resolves_point_and_range_queries() {
    let db = composite(false);
    let mut session = db.session();
    let with_null = insert(&mut session, "Pair", vec![("a", Value::Int(1))]);
    let full = insert(&mut session, "Pair", vec![("a", Value::Int(1)), ("b", Value::Int(2))]);
    insert(&mut session, "Pair", vec![("a", Value::Int(2))]);

    let result = session
        .query(
            "Pair",
            &Predicate::and(vec![Predicate::eq("a", 1i64), Predicate::is_null("b")]),
        )
        .unwrap();
    assert_eq!(result.ids(), vec![with_null]);
    assert_eq!(result.plan.index.as_deref(), Some("Pair.ab"));

    let key = IndexKey::new(vec![KeyComponent::Int(1), KeyComponent::Null]);
    assert_eq!(session.index_get("Pair.ab", &key).unwrap(), vec![with_null]);

    // Nulls sort first within the prefix
    let entries = session
        .index_range("Pair.ab", &KeyRange::prefix(index_key![1i64]), true)
        .unwrap();
    assert_eq!(entries.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![with_null, full]);
    assert_eq!(entries[0].0, key);

    let descending = session
        .index_range("Pair.ab", &KeyRange::prefix(index_key![1i64]), false)
        .unwrap();
    assert_eq!(descending.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![full, with_null]);
}

#[test]
fn null_range_inside_composite_key() {
    let db = composite(false);
    let mut session = db.session();
    let null_low = insert(&mut session, "Pair", vec![("b", Value::Int(1))]);
    insert(&mut session, "Pair", vec![("a", Value::Int(0)), ("b", Value::Int(1))]);

    let from = IndexKey::new(vec![KeyComponent::Null]);
    let to = IndexKey::new(vec![KeyComponent::Null]);
    let entries = session
        .index_range("Pair.ab", &KeyRange::between(from, to, true, true), true)
        .unwrap();
    assert_eq!(entries.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![null_low]);
}

#[test]
fn ignored_nulls_exclude_the_record_entirely() {
    let db = composite(true);
    let mut session = db.session();
    let with_null = insert(&mut session, "Pair", vec![("a", Value::Int(1))]);
    insert(&mut session, "Pair", vec![("a", Value::Int(1)), ("b", Value::Int(2))]);

    assert_eq!(session.index_size("Pair.ab").unwrap(), 1);

    // The index cannot answer IS NULL, the scan still can
    let result = session
        .query(
            "Pair",
            &Predicate::and(vec![Predicate::eq("a", 1i64), Predicate::is_null("b")]),
        )
        .unwrap();
    assert_eq!(result.ids(), vec![with_null]);
    assert!(result.plan.full_scan);
}

#[test]
fn setting_a_null_field_removes_the_entry() {
    let db = composite(true);
    let mut session = db.session();
    let id = insert(&mut session, "Pair", vec![("a", Value::Int(1)), ("b", Value::Int(2))]);
    assert_eq!(session.index_size("Pair.ab").unwrap(), 1);

    let mut doc = session.load(id).unwrap();
    doc.set("b", Value::Null);
    session.save(&mut doc).unwrap();
    assert_eq!(session.index_size("Pair.ab").unwrap(), 0);

    doc.set("b", 5i64);
    session.save(&mut doc).unwrap();
    assert_eq!(session.index_get("Pair.ab", &index_key![1i64, 5i64]).unwrap(), vec![id]);
}

#[test]
fn configured_default_null_policy_applies_to_new_indexes() {
    let mut config = TrellisConfig::default();
    config.index.ignore_null_values = false;
    let db = open_with(config);
    class_with(&db, "P", &[("x", PropertyType::Integer)]);
    index_on(&db, "P", "x", PropertyType::Integer, false);
    let mut session = db.session();
    let id = insert(&mut session, "P", vec![]);

    assert!(!db.index("P.x").unwrap().definition().ignore_null_values());
    let result = session.query("P", &Predicate::is_null("x")).unwrap();
    assert_eq!(result.ids(), vec![id]);
    assert_eq!(result.plan.index.as_deref(), Some("P.x"));
}
