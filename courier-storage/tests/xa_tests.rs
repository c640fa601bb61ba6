//! XA work ordering and restart recovery of the storage environment.

use courier_core::Xid;
use courier_storage::{Database, Environment, MemoryEnvironment, StorageError};
use std::sync::Arc;

fn xid(n: u8) -> Xid {
    Xid::new(123, vec![n, n, n], vec![n])
}

fn setup() -> (MemoryEnvironment, Arc<dyn Database>) {
    let env = MemoryEnvironment::new();
    let db = env.database("test-db").unwrap();
    (env, db)
}

fn assert_illegal<T: std::fmt::Debug>(result: Result<T, StorageError>) {
    match result {
        Err(err) => assert!(err.is_illegal_state(), "expected illegal state, got {err:?}"),
        Ok(value) => panic!("expected illegal state, got Ok({value:?})"),
    }
}

#[test]
fn test_xa_commit_makes_work_visible() {
    let (env, db) = setup();
    let x = xid(1);

    let tx = env.start_work(&x).unwrap();
    db.put(Some(&tx), 1, b"one", 0, 3).unwrap();
    db.put(Some(&tx), 2, b"two", 0, 3).unwrap();
    assert_eq!(db.size().unwrap(), 0);

    env.end_work(&x, false).unwrap();
    env.prepare(&x).unwrap();
    assert_eq!(db.size().unwrap(), 0);

    env.commit(&x).unwrap();
    assert_eq!(db.size().unwrap(), 2);
    assert_eq!(db.get(2).unwrap().as_deref(), Some(&b"two"[..]));
}

#[test]
fn test_xa_rollback_discards_work() {
    let (env, db) = setup();
    db.put(None, 9, b"keep", 0, 4).unwrap();
    let x = xid(2);

    let tx = env.start_work(&x).unwrap();
    db.remove(Some(&tx), 9).unwrap();
    db.put(Some(&tx), 10, b"new", 0, 3).unwrap();
    env.end_work(&x, false).unwrap();
    env.prepare(&x).unwrap();
    env.rollback(&x).unwrap();

    assert_eq!(db.size().unwrap(), 1);
    assert!(db.get(9).unwrap().is_some());
}

#[test]
fn test_end_prepare_commit_rollback_before_start_fail() {
    let (env, _db) = setup();
    let x = xid(3);
    assert_illegal(env.end_work(&x, false));
    assert_illegal(env.prepare(&x));
    assert_illegal(env.commit(&x));
    assert_illegal(env.rollback(&x));
}

#[test]
fn test_start_twice_fails() {
    let (env, _db) = setup();
    let x = xid(4);
    env.start_work(&x).unwrap();
    assert_illegal(env.start_work(&x));
}

#[test]
fn test_prepare_commit_rollback_before_end_fail() {
    let (env, _db) = setup();
    let x = xid(5);
    env.start_work(&x).unwrap();
    assert_illegal(env.prepare(&x));
    assert_illegal(env.commit(&x));
    assert_illegal(env.rollback(&x));
    // Still usable afterwards
    env.end_work(&x, false).unwrap();
    env.prepare(&x).unwrap();
    env.commit(&x).unwrap();
}

#[test]
fn test_end_twice_fails() {
    let (env, _db) = setup();
    let x = xid(6);
    env.start_work(&x).unwrap();
    env.end_work(&x, false).unwrap();
    assert_illegal(env.end_work(&x, false));
}

#[test]
fn test_commit_without_prepare_fails() {
    let (env, _db) = setup();
    let x = xid(7);
    env.start_work(&x).unwrap();
    env.end_work(&x, false).unwrap();
    assert_illegal(env.commit(&x));
}

#[test]
fn test_start_or_end_after_prepare_fail() {
    let (env, _db) = setup();
    let x = xid(8);
    env.start_work(&x).unwrap();
    env.end_work(&x, false).unwrap();
    env.prepare(&x).unwrap();
    assert_illegal(env.start_work(&x));
    assert_illegal(env.end_work(&x, false));
    assert_illegal(env.prepare(&x));
}

#[test]
fn test_xid_forgotten_after_commit_and_rollback() {
    let (env, _db) = setup();
    let x = xid(9);
    env.start_work(&x).unwrap();
    env.end_work(&x, false).unwrap();
    env.prepare(&x).unwrap();
    env.commit(&x).unwrap();
    assert_illegal(env.commit(&x));
    assert_illegal(env.rollback(&x));
    assert_illegal(env.end_work(&x, false));

    env.start_work(&x).unwrap();
    env.end_work(&x, false).unwrap();
    env.rollback(&x).unwrap();
    assert_illegal(env.prepare(&x));
}

#[test]
fn test_wrong_xid_does_not_touch_real_branch() {
    let (env, db) = setup();
    let real = xid(10);
    let wrong = xid(11);
    let tx = env.start_work(&real).unwrap();
    db.put(Some(&tx), 1, b"x", 0, 1).unwrap();

    assert_illegal(env.end_work(&wrong, false));
    assert_illegal(db.put(Some(&courier_storage::TxHandle::Xa(wrong.clone())), 2, b"y", 0, 1));

    env.end_work(&real, false).unwrap();
    assert_illegal(env.prepare(&wrong));
    assert_illegal(env.commit(&wrong));
    env.prepare(&real).unwrap();
    env.commit(&real).unwrap();
    assert_eq!(db.size().unwrap(), 1);
    assert!(db.get(2).unwrap().is_none());
}

#[test]
fn test_write_after_end_rejected() {
    let (env, db) = setup();
    let x = xid(12);
    let tx = env.start_work(&x).unwrap();
    env.end_work(&x, false).unwrap();
    assert_illegal(db.put(Some(&tx), 1, b"late", 0, 4));
}

#[test]
fn test_failed_branch_can_only_roll_back() {
    let (env, db) = setup();
    let x = xid(13);
    let tx = env.start_work(&x).unwrap();
    db.put(Some(&tx), 1, b"x", 0, 1).unwrap();
    env.end_work(&x, true).unwrap();
    assert_illegal(env.prepare(&x));
    env.rollback(&x).unwrap();
    assert_eq!(db.size().unwrap(), 0);
}

#[test]
fn test_restart_before_prepare_discards_work() {
    let (env, db) = setup();
    let x = xid(14);
    let tx = env.start_work(&x).unwrap();
    db.put(Some(&tx), 1, b"x", 0, 1).unwrap();
    env.end_work(&x, false).unwrap();

    env.restart().unwrap();

    assert!(env.in_doubt_xids().unwrap().is_empty());
    assert_illegal(env.prepare(&x));
    assert_eq!(db.size().unwrap(), 0);
}

#[test]
fn test_restart_after_prepare_leaves_branch_in_doubt() {
    let (env, db) = setup();
    let x = xid(15);
    let tx = env.start_work(&x).unwrap();
    db.put(Some(&tx), 1, b"x", 0, 1).unwrap();
    db.put(Some(&tx), 2, b"y", 0, 1).unwrap();
    env.end_work(&x, false).unwrap();
    env.prepare(&x).unwrap();

    env.restart().unwrap();

    assert_eq!(env.in_doubt_xids().unwrap(), vec![x.clone()]);
    assert_eq!(db.size().unwrap(), 0);

    // Resolution with a different id is rejected and changes nothing
    assert_illegal(env.commit(&xid(16)));
    assert_eq!(env.in_doubt_xids().unwrap().len(), 1);

    env.commit(&x).unwrap();
    assert_eq!(db.size().unwrap(), 2);
    assert!(env.in_doubt_xids().unwrap().is_empty());
    // Resolved exactly once
    assert_illegal(env.commit(&x));
}

#[test]
fn test_operations_fail_while_stopped() {
    let (env, db) = setup();
    env.stop().unwrap();
    assert!(matches!(db.put(None, 1, b"x", 0, 1), Err(StorageError::NotStarted)));
    assert!(matches!(env.start_work(&xid(17)), Err(StorageError::NotStarted)));
    env.start().unwrap();
    db.put(None, 1, b"x", 0, 1).unwrap();
}
