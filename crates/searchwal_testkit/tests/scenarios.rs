//! End-to-end scenarios: a primary writes a search table, a standby
//! replays the log and answers the same queries.

use searchwal_core::{Config, FileId};
use searchwal_storage::SegmentStore;
use searchwal_testkit::{Cluster, SearchTable};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn primary_with_table(rows: &[&str]) -> (Cluster, SearchTable) {
    let cluster = Cluster::new(Config::default()).unwrap();
    let table = SearchTable::default();
    cluster
        .transaction(|tx| {
            table.create(tx)?;
            for row in rows {
                table.insert(tx, row)?;
            }
            Ok(())
        })
        .unwrap();
    (cluster, table)
}

#[test]
fn index_built_and_truncated_in_one_transaction_appears_atomically() {
    let (cluster, table) = primary_with_table(&["Mroonga is good too!"]);
    let mut standby = cluster.standby().unwrap();
    standby.catch_up().unwrap();

    let mut tx = cluster.coordinator().begin();
    table.create_index(&mut tx).unwrap();
    table.truncate(&mut tx).unwrap();
    table.insert(&mut tx, "Groonga is good!").unwrap();
    table.insert(&mut tx, "PGroonga is very good!").unwrap();

    // The writer sees its own changes.
    assert_eq!(
        table.index_scan(&tx, "PGroonga").unwrap(),
        Some(strings(&["PGroonga is very good!"]))
    );

    // Nobody else does, on the primary or on the standby.
    standby.catch_up().unwrap();
    for store in [cluster.store(), standby.store()] {
        assert!(!table.has_index(store).unwrap());
        assert_eq!(
            table.seq_scan(store, "good").unwrap(),
            strings(&["Mroonga is good too!"])
        );
    }

    cluster.coordinator().commit(tx).unwrap();
    let caught = standby.catch_up().unwrap();
    assert!(caught.caught_up);

    assert_eq!(
        table.index_scan(standby.store(), "PGroonga").unwrap(),
        Some(strings(&["PGroonga is very good!"]))
    );
    assert_eq!(
        table.index_scan(standby.store(), "Groonga").unwrap(),
        Some(strings(&["Groonga is good!"]))
    );
    assert!(cluster.diverged(standby.store()).unwrap().is_empty());
}

#[test]
fn delete_vacuum_and_reinsert_converge() {
    let (cluster, table) = primary_with_table(&["Groonga is good!", "PGroonga is very good!"]);
    cluster.transaction(|tx| table.create_index(tx)).unwrap();
    let mut standby = cluster.standby().unwrap();

    let (deleted, _) = cluster
        .transaction(|tx| table.delete_matching(tx, "PGroonga"))
        .unwrap();
    assert_eq!(deleted, 1);

    let heap_len = || cluster.store().file_len(table.heap_file()).unwrap().unwrap();
    let before = heap_len();
    cluster.transaction(|tx| table.vacuum(tx)).unwrap();
    assert!(heap_len() < before);

    cluster
        .transaction(|tx| table.insert(tx, "Groonga is very good!"))
        .unwrap();

    standby.catch_up().unwrap();
    let expected = strings(&["Groonga is good!", "Groonga is very good!"]);
    assert_eq!(
        table.index_scan(standby.store(), "good").unwrap(),
        Some(expected.clone())
    );
    assert_eq!(table.seq_scan(standby.store(), "good").unwrap(), expected);
    assert!(table
        .index_scan(standby.store(), "PGroonga")
        .unwrap()
        .unwrap()
        .is_empty());
    assert!(cluster.diverged(standby.store()).unwrap().is_empty());
}

#[test]
fn recheck_removes_key_collisions() {
    let (cluster, table) = primary_with_table(&["database systems", "databases are good"]);
    cluster.transaction(|tx| table.create_index(tx)).unwrap();
    let mut standby = cluster.standby().unwrap();
    standby.catch_up().unwrap();
    let store = standby.store();

    let candidates = table.candidates(store, "databases").unwrap().unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(
        table.index_scan(store, "databases").unwrap(),
        Some(strings(&["databases are good"]))
    );
    assert_eq!(
        table.seq_scan(store, "databases").unwrap(),
        strings(&["databases are good"])
    );
    assert_eq!(
        table.index_scan(store, "DATABASE").unwrap(),
        Some(strings(&["database systems"]))
    );
}

#[test]
fn aborted_work_never_reaches_the_standby() {
    let (cluster, table) = primary_with_table(&["Groonga is good!"]);
    let mut standby = cluster.standby().unwrap();

    let mut tx = cluster.coordinator().begin();
    table.insert(&mut tx, "never committed").unwrap();
    table.create_index(&mut tx).unwrap();
    cluster.coordinator().abort(tx).unwrap();

    standby.catch_up().unwrap();
    assert_eq!(standby.apply_loop().redo_stats().aborted, 1);
    assert_eq!(
        table.seq_scan(standby.store(), "").unwrap(),
        strings(&["Groonga is good!"])
    );
    assert!(!table.has_index(standby.store()).unwrap());
    assert!(cluster.diverged(standby.store()).unwrap().is_empty());
}

#[test]
fn dropped_index_disappears_at_commit() {
    let (cluster, table) = primary_with_table(&["Groonga is good!"]);
    cluster.transaction(|tx| table.create_index(tx)).unwrap();
    let mut standby = cluster.standby().unwrap();
    standby.catch_up().unwrap();
    assert!(table.has_index(standby.store()).unwrap());

    cluster.transaction(|tx| table.drop_index(tx)).unwrap();
    standby.catch_up().unwrap();
    assert!(!table.has_index(standby.store()).unwrap());
    assert_eq!(table.index_scan(standby.store(), "good").unwrap(), None);
    assert_eq!(standby.store().file_ids().unwrap(), vec![FileId::new(1)]);
}

#[test]
fn failed_transaction_body_is_rolled_back() {
    let (cluster, table) = primary_with_table(&[]);
    let err = cluster
        .transaction(|tx| {
            table.insert(tx, "half done")?;
            table.drop_index(tx)
        })
        .unwrap_err();
    assert!(err.to_string().contains("no index"));

    assert!(table.rows(cluster.store()).unwrap().is_empty());
    let mut standby = cluster.standby().unwrap();
    standby.catch_up().unwrap();
    assert!(table.rows(standby.store()).unwrap().is_empty());
}
