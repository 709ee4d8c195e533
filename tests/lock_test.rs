//! Integration tests for the scheduler lock.

use cascade_rs::lock::{self, Acquire, BREAK_FILE, LOCK_FILE, LockGuard, LockOptions};
use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn acquire(dir: &Path, owner: &str) -> Acquire {
    lock::acquire(dir, owner, LockOptions::default()).unwrap()
}

fn expect_guard(acquire: Acquire) -> LockGuard {
    match acquire {
        Acquire::Acquired(guard) => guard,
        Acquire::Denied { holder } => panic!("expected lock, denied by {holder:?}"),
    }
}

#[test]
fn first_owner_wins_second_is_denied() {
    let dir = tempfile::tempdir().unwrap();

    let guard = expect_guard(acquire(dir.path(), "101"));
    assert_eq!(guard.owner(), "101");

    match acquire(dir.path(), "202") {
        Acquire::Denied { holder } => assert_eq!(holder.as_deref(), Some("101")),
        Acquire::Acquired(_) => panic!("two owners held the lock at once"),
    }
    assert_eq!(lock::holder(dir.path()).unwrap().as_deref(), Some("101"));
}

#[test]
fn release_hands_the_lock_over() {
    let dir = tempfile::tempdir().unwrap();

    let guard = expect_guard(acquire(dir.path(), "101"));
    guard.release();
    assert!(!dir.path().join(LOCK_FILE).exists());

    let guard = expect_guard(acquire(dir.path(), "202"));
    assert_eq!(lock::holder(dir.path()).unwrap().as_deref(), Some("202"));
    drop(guard);
}

#[test]
fn dropping_the_guard_releases() {
    let dir = tempfile::tempdir().unwrap();
    {
        let _guard = expect_guard(acquire(dir.path(), "101"));
        assert!(dir.path().join(LOCK_FILE).exists());
    }
    assert!(!dir.path().join(LOCK_FILE).exists());
    assert!(lock::holder(dir.path()).unwrap().is_none());
}

#[test]
fn release_tolerates_token_already_gone() {
    let dir = tempfile::tempdir().unwrap();
    let guard = expect_guard(acquire(dir.path(), "101"));
    std::fs::remove_file(dir.path().join(LOCK_FILE)).unwrap();

    guard.release();
}

#[test]
fn foreign_token_denies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(LOCK_FILE), "scheduler id = 999\n").unwrap();

    match acquire(dir.path(), "101") {
        Acquire::Denied { holder } => assert_eq!(holder.as_deref(), Some("999")),
        Acquire::Acquired(_) => panic!("acquired over a live foreign token"),
    }
    // Denial must not disturb the holder's token.
    assert_eq!(lock::holder(dir.path()).unwrap().as_deref(), Some("999"));
}

#[test]
fn stale_token_is_broken() {
    let dir = tempfile::tempdir().unwrap();
    let two_hours_ago = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
    std::fs::write(
        dir.path().join(LOCK_FILE),
        format!("scheduler id = 999\nacquired at = {two_hours_ago}\n"),
    )
    .unwrap();

    let options = LockOptions {
        stale_after: Duration::from_secs(60 * 60),
    };
    let guard = match lock::acquire(dir.path(), "101", options).unwrap() {
        Acquire::Acquired(guard) => guard,
        Acquire::Denied { holder } => panic!("stale token not broken, held by {holder:?}"),
    };
    assert_eq!(lock::holder(dir.path()).unwrap().as_deref(), Some("101"));
    drop(guard);
}

#[test]
fn recent_token_is_not_broken() {
    let dir = tempfile::tempdir().unwrap();
    let ten_minutes_ago = (Utc::now() - ChronoDuration::minutes(10)).to_rfc3339();
    std::fs::write(
        dir.path().join(LOCK_FILE),
        format!("scheduler id = 999\nacquired at = {ten_minutes_ago}\n"),
    )
    .unwrap();

    assert!(matches!(acquire(dir.path(), "101"), Acquire::Denied { .. }));
}

#[test]
fn racing_owners_get_exactly_one_lock() {
    let dir = tempfile::tempdir().unwrap();
    let contenders = 16;
    let start = Arc::new(Barrier::new(contenders));
    let hold = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|i| {
            let dir = dir.path().to_path_buf();
            let start = Arc::clone(&start);
            let hold = Arc::clone(&hold);
            std::thread::spawn(move || {
                start.wait();
                let result = lock::acquire(&dir, &format!("job-{i}"), LockOptions::default())
                    .unwrap();
                // Everyone keeps what they got until all have tried.
                hold.wait();
                matches!(result, Acquire::Acquired(_))
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

fn stale_token(dir: &Path) {
    let two_hours_ago = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
    std::fs::write(
        dir.join(LOCK_FILE),
        format!("scheduler id = 999\nacquired at = {two_hours_ago}\n"),
    )
    .unwrap();
}

#[test]
fn racing_breakers_of_a_stale_token_get_exactly_one_lock() {
    for _ in 0..20 {
        let dir = tempfile::tempdir().unwrap();
        stale_token(dir.path());
        let contenders = 16;
        let start = Arc::new(Barrier::new(contenders));
        let hold = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let dir = dir.path().to_path_buf();
                let start = Arc::clone(&start);
                let hold = Arc::clone(&hold);
                std::thread::spawn(move || {
                    start.wait();
                    let result =
                        lock::acquire(&dir, &format!("job-{i}"), LockOptions::default()).unwrap();
                    hold.wait();
                    matches!(result, Acquire::Acquired(_))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1, "{winners} jobs hold the lock at once");
        assert!(!dir.path().join(BREAK_FILE).exists());
    }
}

#[test]
fn taken_over_guard_leaves_the_new_token() {
    let dir = tempfile::tempdir().unwrap();
    let Acquire::Acquired(guard) = acquire(dir.path(), "101") else {
        panic!("expected to acquire");
    };
    // Someone broke our token and took the lock.
    std::fs::write(dir.path().join(LOCK_FILE), "scheduler id = 202\n").unwrap();

    guard.release();

    assert_eq!(lock::holder(dir.path()).unwrap().as_deref(), Some("202"));
}

#[test]
fn leftover_break_marker_is_cleared_for_the_next_turn() {
    let dir = tempfile::tempdir().unwrap();
    stale_token(dir.path());
    let marker = dir.path().join(BREAK_FILE);
    std::fs::write(&marker, "").unwrap();
    let options = LockOptions {
        stale_after: Duration::ZERO,
    };
    std::thread::sleep(Duration::from_millis(10));

    // The marker blocks this attempt but is cleared because it is stale too.
    let first = lock::acquire(dir.path(), "101", options).unwrap();
    assert!(matches!(first, Acquire::Denied { .. }));
    assert!(!marker.exists());

    let second = lock::acquire(dir.path(), "101", options).unwrap();
    assert!(matches!(second, Acquire::Acquired(_)));
}
