//! Indexes over list, set and map fields

use crate::common::*;
use std::collections::BTreeMap;
use std::sync::Arc;

fn tagged() -> Arc<Database> {
    let db = open();
    db.create_class("Post").unwrap();
    db.create_property(
        "Post",
        PropertyDef::new("tags", PropertyType::EmbeddedList).with_element_type(PropertyType::String),
    )
    .unwrap();
    db.create_index(
        IndexDefinition::builder("Post.tags", "Post").field(IndexedField::new("tags", PropertyType::EmbeddedList)),
    )
    .unwrap();
    db
}

fn tags(values: &[&str]) -> Value {
    Value::List(values.iter().map(|v| Value::from(*v)).collect())
}

#[test]
fn every_element_is_a_key() {
    let db = tagged();
    let mut session = db.session();
    let id = insert(&mut session, "Post", vec![("tags", tags(&["rust", "db", "rust"]))]);

    assert_eq!(session.index_get("Post.tags", &index_key!["rust"]).unwrap(), vec![id]);
    assert_eq!(session.index_get("Post.tags", &index_key!["db"]).unwrap(), vec![id]);
    // Duplicate elements of one record collapse
    assert_eq!(session.index_size("Post.tags").unwrap(), 2);

    let result = session.query("Post", &Predicate::eq("tags", "db")).unwrap();
    assert_eq!(result.ids(), vec![id]);
    assert_eq!(result.plan.index.as_deref(), Some("Post.tags"));
}

#[test]
fn updating_a_collection_changes_only_the_difference() {
    let db = tagged();
    let mut session = db.session();
    let id = insert(&mut session, "Post", vec![("tags", tags(&["a", "b"]))]);

    session.begin().unwrap();
    let mut doc = session.load(id).unwrap();
    doc.set("tags", tags(&["b", "c"]));
    session.save(&mut doc).unwrap();

    let overlay = session.index_changes("Post.tags").unwrap();
    assert!(overlay.key_changes(&index_key!["b"]).is_none());
    assert!(overlay.key_changes(&index_key!["a"]).is_some());
    assert!(overlay.key_changes(&index_key!["c"]).is_some());
    session.commit().unwrap();

    let keys: Vec<IndexKey> = session
        .index_stream_all("Post.tags", true)
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, vec![index_key!["b"], index_key!["c"]]);
}

#[test]
fn composite_with_collection_expands_per_element() {
    let db = open();
    db.create_class("Post").unwrap();
    db.create_index(
        IndexDefinition::builder("Post.author_tags", "Post")
            .property("author", PropertyType::String)
            .field(
                IndexedField::new("tags", PropertyType::EmbeddedSet)
                    .with_element_type(PropertyType::String),
            ),
    )
    .unwrap();
    let mut session = db.session();
    let id = insert(
        &mut session,
        "Post",
        vec![("author", Value::from("ann")), ("tags", tags(&["x", "y"]))],
    );

    let entries = session
        .index_range("Post.author_tags", &KeyRange::prefix(index_key!["ann"]), true)
        .unwrap();
    assert_eq!(
        entries,
        vec![(index_key!["ann", "x"], id), (index_key!["ann", "y"], id)]
    );
}

#[test]
fn empty_collection_uses_null_placeholder_when_nulls_are_kept() {
    let db = open();
    db.create_class("Post").unwrap();
    db.create_index(
        IndexDefinition::builder("Post.author_tags", "Post")
            .property("author", PropertyType::String)
            .field(
                IndexedField::new("tags", PropertyType::EmbeddedList)
                    .with_element_type(PropertyType::String),
            )
            .ignore_null_values(false),
    )
    .unwrap();
    let mut session = db.session();
    let id = insert(
        &mut session,
        "Post",
        vec![("author", Value::from("ann")), ("tags", tags(&[]))],
    );

    let key = IndexKey::new(vec![KeyComponent::from("ann"), KeyComponent::Null]);
    assert_eq!(session.index_get("Post.author_tags", &key).unwrap(), vec![id]);
}

#[test]
fn map_indexed_by_key_and_by_value() {
    let db = open();
    db.create_class("Doc").unwrap();
    db.create_index(
        IndexDefinition::builder("Doc.names_by_key", "Doc")
            .field(IndexedField::new("names", PropertyType::EmbeddedMap)),
    )
    .unwrap();
    db.create_index(
        IndexDefinition::builder("Doc.names_by_value", "Doc").field(
            IndexedField::new("names", PropertyType::EmbeddedMap)
                .with_element_type(PropertyType::String)
                .by_value(),
        ),
    )
    .unwrap();

    let mut names = BTreeMap::new();
    names.insert("en".to_string(), Value::from("hello"));
    names.insert("fr".to_string(), Value::from("bonjour"));
    let mut session = db.session();
    let id = insert(&mut session, "Doc", vec![("names", Value::Map(names))]);

    assert_eq!(session.index_get("Doc.names_by_key", &index_key!["fr"]).unwrap(), vec![id]);
    assert_eq!(session.index_get("Doc.names_by_value", &index_key!["hello"]).unwrap(), vec![id]);
    assert!(session.index_get("Doc.names_by_value", &index_key!["en"]).unwrap().is_empty());
}

#[test]
fn collection_without_element_type_is_rejected() {
    let db = open();
    db.create_class("Post").unwrap();
    let err = db
        .create_index(
            IndexDefinition::builder("Post.tags", "Post")
                .field(IndexedField::new("tags", PropertyType::EmbeddedList)),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(db.index_names().is_empty());
}

#[test]
fn uncoercible_value_is_rejected_before_staging() {
    let db = open();
    db.create_class("P").unwrap();
    index_on(&db, "P", "age", PropertyType::Integer, false);
    let mut session = db.session();

    session.begin().unwrap();
    let err = session
        .save(&mut Document::new("P").with("age", "forty"))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(session.pending_operations().unwrap().is_empty());
    session.rollback().unwrap();

    // Coercible strings are accepted and stored under the declared type
    let id = insert(&mut session, "P", vec![("age", Value::from("40"))]);
    assert_eq!(session.index_get("P.age", &index_key![40i64]).unwrap(), vec![id]);
}
