//! Collated keys and collation changes

use crate::common::*;
use std::sync::Arc;
use trellisdb::Collation;

#[test]
fn case_insensitive_lookups_are_equivalent() {
    let db = open();
    db.create_class("Word").unwrap();
    db.create_property("Word", PropertyDef::new("text", PropertyType::String).with_collation("ci"))
        .unwrap();
    index_on(&db, "Word", "text", PropertyType::String, false);

    let mut session = db.session();
    let id = insert(&mut session, "Word", vec![("text", Value::from("Val"))]);

    let expected = vec![id];
    for spelling in ["VAL", "val", "vAl", "Val", "vaL"] {
        assert_eq!(session.index_get("Word.text", &index_key![spelling]).unwrap(), expected, "{spelling}");
    }

    let result = session.query("Word", &Predicate::eq("text", "VAL")).unwrap();
    assert_eq!(result.ids(), expected);
    assert_eq!(result.plan.index.as_deref(), Some("Word.text"));
}

#[test]
fn case_insensitive_unique_index_rejects_case_variants() {
    let db = open();
    db.create_class("User").unwrap();
    db.create_property("User", PropertyDef::new("login", PropertyType::String).with_collation("ci"))
        .unwrap();
    index_on(&db, "User", "login", PropertyType::String, true);

    let mut session = db.session();
    let first = insert(&mut session, "User", vec![("login", Value::from("Admin"))]);
    let err = session
        .save(&mut Document::new("User").with("login", "ADMIN"))
        .unwrap_err();
    match err {
        Error::DuplicateKey { index, existing, .. } => {
            assert_eq!(index, "User.login");
            assert_eq!(existing, first);
        }
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
}

#[test]
fn collation_change_reindexes_existing_data() {
    let db = open();
    class_with(&db, "Word", &[("text", PropertyType::String)]);
    index_on(&db, "Word", "text", PropertyType::String, false);
    let mut session = db.session();
    let id = insert(&mut session, "Word", vec![("text", Value::from("Alpha"))]);

    assert!(session.index_get("Word.text", &index_key!["ALPHA"]).unwrap().is_empty());
    assert!(session.query("Word", &Predicate::eq("text", "alpha")).unwrap().is_empty());

    db.set_property_collation("Word", "text", "ci").unwrap();

    assert_eq!(session.index_get("Word.text", &index_key!["ALPHA"]).unwrap(), vec![id]);
    let result = session.query("Word", &Predicate::eq("text", "alpha")).unwrap();
    assert_eq!(result.ids(), vec![id]);
    assert_eq!(
        db.index("Word.text").unwrap().definition().collation_name("text"),
        Some("ci")
    );

    // New writes use the new collation too
    let other = insert(&mut session, "Word", vec![("text", Value::from("ALPHA"))]);
    assert_eq!(session.index_get("Word.text", &index_key!["alpha"]).unwrap(), vec![id, other]);
}

#[test]
fn range_scan_follows_collation_order() {
    let db = open();
    db.create_class("Word").unwrap();
    db.create_property("Word", PropertyDef::new("text", PropertyType::String).with_collation("ci"))
        .unwrap();
    index_on(&db, "Word", "text", PropertyType::String, false);
    let mut session = db.session();
    for text in ["banana", "Apple", "cherry", "BANANA"] {
        insert(&mut session, "Word", vec![("text", Value::from(text))]);
    }

    let result = session
        .query(
            "Word",
            &Predicate::and(vec![Predicate::ge("text", "APPLE"), Predicate::le("text", "Banana")]),
        )
        .unwrap();
    assert_eq!(result.len(), 3);
    assert!(result.plan.range_converted);
}

#[test]
fn index_field_collation_applies_to_query_filtering() {
    let db = open();
    class_with(&db, "Collate", &[("cip", PropertyType::String)]);
    db.create_index(
        IndexDefinition::builder("Collate.cip", "Collate")
            .field(IndexedField::new("cip", PropertyType::String).with_collation("ci")),
    )
    .unwrap();

    let mut session = db.session();
    for i in 0..10 {
        let text = if i % 2 == 0 { "VAL" } else { "val" };
        insert(&mut session, "Collate", vec![("cip", Value::from(text))]);
    }

    let metrics = Arc::new(CountingMetrics::new());
    let reader = db.session_with_metrics(metrics.clone());
    let result = reader.query("Collate", &Predicate::eq("cip", "VaL")).unwrap();
    assert_eq!(result.len(), 10);
    assert_eq!(result.plan.index.as_deref(), Some("Collate.cip"));
    assert_eq!(metrics.uses_of("Collate.cip"), 1);

    // Once the index is gone nothing declares ci for the field
    db.drop_index("Collate.cip").unwrap();
    let scanned = reader.query("Collate", &Predicate::eq("cip", "VaL")).unwrap();
    assert!(scanned.plan.full_scan);
    assert!(scanned.is_empty());
}

/// Orders strings by their reversed characters
#[derive(Debug)]
struct ReversedCollation;

impl Collation for ReversedCollation {
    fn name(&self) -> &str {
        "reversed"
    }

    fn transform(&self, component: KeyComponent) -> KeyComponent {
        match component {
            KeyComponent::String(s) => KeyComponent::String(s.chars().rev().collect()),
            other => other,
        }
    }
}

#[test]
fn registered_collation_is_usable_by_indexes() {
    let db = open();
    db.register_collation(Arc::new(ReversedCollation));
    db.create_class("Word").unwrap();
    db.create_index(
        IndexDefinition::builder("Word.text", "Word")
            .field(IndexedField::new("text", PropertyType::String).with_collation("reversed")),
    )
    .unwrap();

    let mut session = db.session();
    let ab = insert(&mut session, "Word", vec![("text", Value::from("ab"))]);
    let ba = insert(&mut session, "Word", vec![("text", Value::from("ba"))]);

    // "ba" reversed is "ab", which sorts first
    let order: Vec<RecordId> = session
        .index_stream_all("Word.text", true)
        .unwrap()
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    assert_eq!(order, vec![ba, ab]);
    assert_eq!(session.index_get("Word.text", &index_key!["ab"]).unwrap(), vec![ab]);
}

#[test]
fn unknown_collation_is_a_validation_error() {
    let db = open();
    db.create_class("Word").unwrap();
    let err = db
        .create_property("Word", PropertyDef::new("text", PropertyType::String).with_collation("nope"))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = db
        .create_index(
            IndexDefinition::builder("Word.text", "Word")
                .field(IndexedField::new("text", PropertyType::String).with_collation("nope")),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
