//! Transaction isolation, conflicts and concurrent writers

use crate::common::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use trellisdb::RetryConfig;

fn counters() -> Arc<Database> {
    let db = open();
    class_with(&db, "Counter", &[("n", PropertyType::Integer)]);
    index_on(&db, "Counter", "n", PropertyType::Integer, false);
    db
}

#[test]
fn uncommitted_changes_are_invisible_to_other_sessions() {
    let db = counters();
    let mut writer = db.session();
    let reader = db.session();
    writer.begin().unwrap();
    let id = insert(&mut writer, "Counter", vec![("n", Value::Int(1))]);

    assert_eq!(writer.index_stream_all("Counter.n", true).unwrap().len(), 1);
    assert!(reader.index_stream_all("Counter.n", true).unwrap().is_empty());
    assert!(reader.index_stream_entries("Counter.n", &[index_key![1i64]], true).unwrap().is_empty());
    assert!(reader.query("Counter", &Predicate::eq("n", 1i64)).unwrap().is_empty());
    assert_eq!(writer.query("Counter", &Predicate::eq("n", 1i64)).unwrap().ids(), vec![id]);

    writer.commit().unwrap();
    assert_eq!(reader.index_stream_all("Counter.n", true).unwrap(), vec![(index_key![1i64], id)]);
}

#[test]
fn pending_delete_hides_committed_entry_from_own_reads_only() {
    let db = counters();
    let mut session = db.session();
    let id = insert(&mut session, "Counter", vec![("n", Value::Int(5))]);
    let other = db.session();

    session.begin().unwrap();
    session.delete(id).unwrap();
    assert!(session.index_get("Counter.n", &index_key![5i64]).unwrap().is_empty());
    assert!(session.query("Counter", &Predicate::eq("n", 5i64)).unwrap().is_empty());
    assert!(matches!(session.load(id), Err(Error::RecordNotFound(_))));

    assert_eq!(other.index_get("Counter.n", &index_key![5i64]).unwrap(), vec![id]);
    // Still physically present until commit
    assert_eq!(session.get_ignoring_transaction("Counter.n", &index_key![5i64]).unwrap(), vec![id]);

    session.commit().unwrap();
    assert!(other.index_get("Counter.n", &index_key![5i64]).unwrap().is_empty());
}

#[test]
fn conflicting_update_aborts_every_index_change() {
    let db = open();
    class_with(&db, "Acct", &[("owner", PropertyType::String), ("balance", PropertyType::Integer)]);
    index_on(&db, "Acct", "owner", PropertyType::String, false);
    index_on(&db, "Acct", "balance", PropertyType::Integer, false);
    let mut setup = db.session();
    let a = insert(&mut setup, "Acct", vec![("owner", Value::from("ann")), ("balance", Value::Int(10))]);
    let b = insert(&mut setup, "Acct", vec![("owner", Value::from("bob")), ("balance", Value::Int(20))]);

    let mut first = db.session();
    let mut second = db.session();
    first.begin().unwrap();
    second.begin().unwrap();

    let mut doc = first.load(a).unwrap();
    doc.set("balance", 11i64);
    first.save(&mut doc).unwrap();

    // The second transaction touches both records, one of them stale
    let mut doc_b = second.load(b).unwrap();
    doc_b.set("owner", "bobby");
    second.save(&mut doc_b).unwrap();
    let mut doc_a = second.load(a).unwrap();
    doc_a.set("balance", 99i64);
    second.save(&mut doc_a).unwrap();

    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert!(matches!(err, Error::ConcurrentModification { record, .. } if record == a));

    let reader = db.session();
    assert!(reader.index_get("Acct.balance", &index_key![99i64]).unwrap().is_empty());
    assert!(reader.index_get("Acct.owner", &index_key!["bobby"]).unwrap().is_empty());
    assert_eq!(reader.index_get("Acct.owner", &index_key!["bob"]).unwrap(), vec![b]);
    assert_eq!(reader.index_get("Acct.balance", &index_key![11i64]).unwrap(), vec![a]);
}

#[test]
fn concurrent_writers_on_disjoint_records() {
    const THREADS: usize = 4;
    const PER_THREAD: i64 = 50;

    let db = counters();
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut session = db.session();
                for i in 0..PER_THREAD {
                    let n = t as i64 * 1_000 + i;
                    insert(&mut session, "Counter", vec![("n", Value::Int(n))]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let session = db.session();
    assert_eq!(session.index_size("Counter.n").unwrap(), THREADS * PER_THREAD as usize);
    let result = session
        .query(
            "Counter",
            &Predicate::and(vec![Predicate::ge("n", 1_000i64), Predicate::le("n", 1_049i64)]),
        )
        .unwrap();
    assert_eq!(result.len(), PER_THREAD as usize);
    assert_eq!(db.metrics().active_count, 0);
}

#[test]
fn retried_increments_are_never_lost() {
    const THREADS: usize = 4;
    const INCREMENTS: i64 = 25;

    let db = counters();
    let mut setup = db.session();
    let id = insert(&mut setup, "Counter", vec![("n", Value::Int(0))]);

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let retry = RetryConfig::new()
                    .with_max_retries(10_000)
                    .with_backoff(Duration::ZERO, Duration::from_millis(1));
                for _ in 0..INCREMENTS {
                    db.transaction_with_retry(retry.clone(), |session| {
                        let mut doc = session.load(id)?;
                        let n = match doc.get("n") {
                            Value::Int(n) => *n,
                            _ => 0,
                        };
                        doc.set("n", n + 1);
                        session.save(&mut doc).map(|_| ())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = THREADS as i64 * INCREMENTS;
    let session = db.session();
    assert_eq!(session.load(id).unwrap().get("n"), &Value::Int(total));
    // Exactly one entry, under the final value
    assert_eq!(
        session.index_stream_all("Counter.n", true).unwrap(),
        vec![(index_key![total], id)]
    );
}
