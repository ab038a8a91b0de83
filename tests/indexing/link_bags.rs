//! Adaptive link collections stored in records

use crate::common::*;
use std::sync::Arc;
use trellisdb::{AdaptiveLinkCollection, ConversionThresholds};

fn graph(config: TrellisConfig) -> (Arc<Database>, Vec<RecordId>) {
    let db = open_with(config);
    class_with(&db, "V", &[]);
    class_with(&db, "Node", &[("out", PropertyType::LinkBag)]);
    let mut session = db.session();
    let targets = (0..8).map(|_| insert(&mut session, "V", vec![])).collect();
    (db, targets)
}

fn bag_of(db: &Database, session: &Session, id: RecordId) -> (bool, Vec<RecordId>) {
    let doc = session.load(id).unwrap();
    let bag = doc.get("out").as_link_bag().unwrap();
    (bag.is_tree_backed(), bag.to_sorted_vec(db.pages().as_ref()).unwrap())
}

#[test]
fn collection_becomes_tree_backed_at_threshold() {
    let (db, targets) = graph(tree_threshold_config(4));
    let mut session = db.session();

    let small = AdaptiveLinkCollection::from_ids(targets[..3].iter().copied(), ConversionThresholds::default());
    let id = session.save(&mut Document::new("Node").with("out", small)).unwrap();
    let (tree_backed, ids) = bag_of(&db, &session, id);
    assert!(!tree_backed);
    assert_eq!(ids, targets[..3].to_vec());
    assert_eq!(db.pages().page_count(), 0);

    let mut doc = session.load(id).unwrap();
    doc.link_bag_mut("out").unwrap().add(targets[3]);
    session.save(&mut doc).unwrap();
    let (tree_backed, ids) = bag_of(&db, &session, id);
    assert!(tree_backed);
    assert_eq!(ids, targets[..4].to_vec());
    assert!(db.pages().page_count() > 0);
}

#[test]
fn shrinking_does_not_convert_back_by_default() {
    let (db, targets) = graph(tree_threshold_config(4));
    let mut session = db.session();
    let bag = AdaptiveLinkCollection::from_ids(targets[..5].iter().copied(), ConversionThresholds::default());
    let id = session.save(&mut Document::new("Node").with("out", bag)).unwrap();

    let mut doc = session.load(id).unwrap();
    {
        let pages = db.pages().as_ref();
        let bag = doc.link_bag_mut("out").unwrap();
        for target in &targets[..4] {
            bag.remove(*target, pages).unwrap();
        }
    }
    session.save(&mut doc).unwrap();

    let (tree_backed, ids) = bag_of(&db, &session, id);
    assert!(tree_backed);
    assert_eq!(ids, vec![targets[4]]);
}

#[test]
fn configured_low_water_mark_converts_back_on_save() {
    let mut config = tree_threshold_config(4);
    config.link_bag.tree_to_embedded_threshold = 2;
    let (db, targets) = graph(config);
    let mut session = db.session();
    let bag = AdaptiveLinkCollection::from_ids(targets[..5].iter().copied(), ConversionThresholds::default());
    let id = session.save(&mut Document::new("Node").with("out", bag)).unwrap();
    assert!(bag_of(&db, &session, id).0);

    let mut doc = session.load(id).unwrap();
    {
        let pages = db.pages().as_ref();
        let bag = doc.link_bag_mut("out").unwrap();
        for target in &targets[..3] {
            bag.remove(*target, pages).unwrap();
        }
    }
    session.save(&mut doc).unwrap();

    let (tree_backed, ids) = bag_of(&db, &session, id);
    assert!(!tree_backed);
    assert_eq!(ids, targets[3..5].to_vec());
    assert_eq!(db.pages().page_count(), 0);
}

#[test]
fn duplicates_are_kept_and_removed_one_at_a_time() {
    for threshold in [40, 0] {
        let (db, targets) = graph(tree_threshold_config(threshold));
        let mut session = db.session();
        let x = targets[0];
        let mut bag = AdaptiveLinkCollection::new();
        bag.add(x);
        bag.add(x);
        let id = session.save(&mut Document::new("Node").with("out", bag)).unwrap();

        let mut doc = session.load(id).unwrap();
        let removed = doc
            .link_bag_mut("out")
            .unwrap()
            .remove(x, db.pages().as_ref())
            .unwrap();
        assert!(removed);
        session.save(&mut doc).unwrap();

        let (_, ids) = bag_of(&db, &session, id);
        assert_eq!(ids, vec![x], "threshold {threshold}");
    }
}

#[test]
fn deleting_the_owner_releases_tree_storage() {
    let (db, targets) = graph(tree_threshold_config(0));
    let mut session = db.session();
    let bag = AdaptiveLinkCollection::from_ids(targets.iter().copied(), ConversionThresholds::default());
    let id = session.save(&mut Document::new("Node").with("out", bag)).unwrap();
    assert!(db.pages().page_count() > 0);

    session.delete(id).unwrap();
    assert_eq!(db.pages().page_count(), 0);
    assert!(matches!(session.load(id), Err(Error::RecordNotFound(_))));
}

#[test]
fn replacing_the_field_releases_the_old_tree() {
    let (db, targets) = graph(tree_threshold_config(0));
    let mut session = db.session();
    let bag = AdaptiveLinkCollection::from_ids(targets.iter().copied(), ConversionThresholds::default());
    let id = session.save(&mut Document::new("Node").with("out", bag)).unwrap();

    let mut doc = session.load(id).unwrap();
    doc.remove("out");
    session.save(&mut doc).unwrap();
    assert_eq!(db.pages().page_count(), 0);
}

#[test]
fn copied_collection_gets_its_own_tree() {
    let (db, targets) = graph(tree_threshold_config(0));
    let mut session = db.session();
    let bag = AdaptiveLinkCollection::from_ids(targets[..3].iter().copied(), ConversionThresholds::default());
    let first = session.save(&mut Document::new("Node").with("out", bag)).unwrap();

    let original = session.load(first).unwrap();
    let copy = original.get("out").clone();
    let second = session.save(&mut Document::new("Node").with("out", copy)).unwrap();

    // Deleting the original leaves the copy readable
    session.delete(first).unwrap();
    let (tree_backed, ids) = bag_of(&db, &session, second);
    assert!(tree_backed);
    assert_eq!(ids, targets[..3].to_vec());
}

#[test]
fn stale_bag_after_concurrent_delete_reports_missing_owner() {
    let (db, targets) = graph(tree_threshold_config(0));
    let mut writer = db.session();
    let bag = AdaptiveLinkCollection::from_ids(targets.iter().copied(), ConversionThresholds::default());
    let id = writer.save(&mut Document::new("Node").with("out", bag)).unwrap();

    let reader = db.session();
    let mut doc = reader.load(id).unwrap();

    writer.delete(id).unwrap();
    assert_eq!(db.pages().page_count(), 0);

    let pages = db.pages().as_ref();
    let bag = doc.link_bag_mut("out").unwrap();
    assert!(matches!(bag.remove(targets[0], pages), Err(Error::RecordNotFound(gone)) if gone == id));
    assert!(matches!(bag.to_vec(pages), Err(Error::RecordNotFound(_))));
}
