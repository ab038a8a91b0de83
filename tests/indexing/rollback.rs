//! Rollback restores, commit folds: property tests over random operations

use crate::common::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert(i64),
    Update(usize, i64),
    Delete(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..8).prop_map(Op::Insert),
        (0usize..16, 0i64..8).prop_map(|(i, v)| Op::Update(i, v)),
        (0usize..16).prop_map(Op::Delete),
    ]
}

fn database() -> Arc<Database> {
    let db = open();
    class_with(&db, "R", &[("v", PropertyType::Integer)]);
    index_on(&db, "R", "v", PropertyType::Integer, false);
    db
}

/// Apply `ops` in `session`, mirroring them into `model`
fn run(session: &mut Session, model: &mut BTreeMap<RecordId, i64>, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Insert(v) => {
                let id = insert(session, "R", vec![("v", Value::Int(*v))]);
                model.insert(id, *v);
            }
            Op::Update(i, v) => {
                if model.is_empty() {
                    continue;
                }
                let id = *model.keys().nth(i % model.len()).unwrap();
                let mut doc = session.load(id).unwrap();
                doc.set("v", *v);
                session.save(&mut doc).unwrap();
                model.insert(id, *v);
            }
            Op::Delete(i) => {
                if model.is_empty() {
                    continue;
                }
                let id = *model.keys().nth(i % model.len()).unwrap();
                session.delete(id).unwrap();
                model.remove(&id);
            }
        }
    }
}

fn expected_entries(model: &BTreeMap<RecordId, i64>) -> Vec<(IndexKey, RecordId)> {
    let mut entries: Vec<(IndexKey, RecordId)> =
        model.iter().map(|(id, v)| (index_key![*v], *id)).collect();
    entries.sort();
    entries
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn rollback_restores_pre_transaction_state(
        setup in prop::collection::vec(op(), 0..12),
        ops in prop::collection::vec(op(), 1..24),
    ) {
        let db = database();
        let mut session = db.session();
        let mut model = BTreeMap::new();
        run(&mut session, &mut model, &setup);
        let before = session.index_stream_all("R.v", true).unwrap();
        let pages_before = db.pages().page_count();

        session.begin().unwrap();
        let mut scratch = model.clone();
        run(&mut session, &mut scratch, &ops);
        prop_assert_eq!(session.index_stream_all("R.v", true).unwrap(), expected_entries(&scratch));
        session.rollback().unwrap();

        prop_assert_eq!(session.index_stream_all("R.v", true).unwrap(), before.clone());
        prop_assert_eq!(before, expected_entries(&model));
        prop_assert_eq!(db.pages().page_count(), pages_before);
    }

    #[test]
    fn commit_equals_folding_the_operations(
        ops in prop::collection::vec(op(), 1..32),
    ) {
        let db = database();
        let mut session = db.session();
        let mut model = BTreeMap::new();

        session.begin().unwrap();
        run(&mut session, &mut model, &ops);
        session.commit().unwrap();

        let committed = db.index("R.v").unwrap().stream_all(true).unwrap();
        prop_assert_eq!(committed, expected_entries(&model));
        prop_assert_eq!(db.index("R.v").unwrap().size(), model.len());
    }
}
