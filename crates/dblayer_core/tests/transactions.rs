//! Transaction stacks, checkpoints, index erasure and out-of-disk handling
//! through the public layer API.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use dblayer_core::engine::MemorySegments;
use dblayer_core::guardian::GUARDIAN_FILE;
use dblayer_core::{DbError, DbLayer, DbLayerConfig, DbMode, DbValue, IndexStatus, Instance};
use proptest::prelude::*;
use tempfile::tempdir;

fn config(dir: &Path) -> DbLayerConfig {
    DbLayerConfig::new(dir).with_thread_timing(10, 2_000)
}

fn write(layer: &DbLayer, instance: &Instance, key: &[u8], value: &[u8]) {
    let txn = layer.txn_begin(instance, None).unwrap();
    {
        let db = layer.get_primary(instance).unwrap();
        db.put(txn.handle(), key, value).unwrap();
    }
    layer.txn_commit(instance, Some(&txn)).unwrap();
}

fn read(layer: &DbLayer, instance: &Instance, key: &[u8]) -> Option<Vec<u8>> {
    let db = layer.get_primary(instance).unwrap();
    let mut data = DbValue::new();
    match db.get(None, key, &mut data) {
        Ok(()) => Some(data.as_slice().to_vec()),
        Err(DbError::NotFound) => None,
        Err(err) => panic!("unexpected read failure: {err}"),
    }
}

#[test]
fn child_commit_is_undone_by_parent_abort() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();

    let parent = layer.txn_begin(&instance, None).unwrap();
    let child = layer.txn_begin(&instance, Some(&parent)).unwrap();
    assert_eq!(layer.txn_depth(), 2);
    {
        let db = layer.get_primary(&instance).unwrap();
        db.put(child.handle(), b"uid=alice", b"entry").unwrap();
    }
    layer.txn_commit(&instance, Some(&child)).unwrap();
    assert_eq!(layer.txn_depth(), 1);
    layer.txn_abort(&instance, Some(&parent)).unwrap();
    assert_eq!(layer.txn_depth(), 0);

    assert_eq!(read(&layer, &instance, b"uid=alice"), None);
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn implicit_transactions_resolve_the_top_of_the_stack() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    layer.start(DbMode::NORMAL).unwrap();

    let outer = layer.txn_begin_all(None).unwrap();
    let inner = layer.txn_begin_all(None).unwrap();
    assert_eq!(layer.txn_depth(), 2);
    assert_eq!(
        layer.txn_init().handle().map(|t| t.id()),
        inner.handle().map(|t| t.id())
    );

    layer.txn_commit_all(None).unwrap();
    assert_eq!(
        layer.txn_init().handle().map(|t| t.id()),
        outer.handle().map(|t| t.id())
    );
    layer.txn_commit_all(None).unwrap();
    assert_eq!(layer.txn_depth(), 0);
    assert!(layer.txn_init().is_none());

    // Nothing left to resolve.
    layer.txn_commit_all(None).unwrap();
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn stacks_are_per_thread() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    layer.start(DbMode::NORMAL).unwrap();

    let txn = layer.read_txn_begin(None).unwrap();
    let other = layer.clone();
    let depth = thread::spawn(move || other.txn_depth()).join().unwrap();
    assert_eq!(depth, 0);
    assert_eq!(layer.txn_depth(), 1);
    layer.read_txn_abort(Some(&txn)).unwrap();
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn disabled_transactions_hand_out_empty_handles() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path()).with_transactions(false)).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let txn = layer.txn_begin_all(None).unwrap();
    assert!(txn.is_none());
    assert_eq!(layer.txn_depth(), 0);
    layer.txn_commit_all(Some(&txn)).unwrap();
    layer.close(DbMode::NORMAL).unwrap();
}

#[derive(Debug, Clone)]
enum StackOp {
    Begin,
    Commit,
    Abort,
}

fn stack_op() -> impl Strategy<Value = StackOp> {
    prop_oneof![Just(StackOp::Begin), Just(StackOp::Commit), Just(StackOp::Abort)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn stack_depth_follows_begins_and_resolutions(ops in prop::collection::vec(stack_op(), 1..24)) {
        let dir = tempdir().unwrap();
        let layer = DbLayer::init(config(dir.path())).unwrap();
        layer.start(DbMode::NORMAL | DbMode::NO_DBTHREADS).unwrap();

        let mut depth = 0usize;
        for op in ops {
            match op {
                StackOp::Begin => {
                    layer.txn_begin_all(None).unwrap();
                    depth += 1;
                }
                StackOp::Commit => {
                    layer.txn_commit_all(None).unwrap();
                    depth = depth.saturating_sub(1);
                }
                StackOp::Abort => {
                    layer.txn_abort_all(None).unwrap();
                    depth = depth.saturating_sub(1);
                }
            }
            prop_assert_eq!(layer.txn_depth(), depth);
        }
        while layer.txn_depth() > 0 {
            layer.txn_abort_all(None).unwrap();
        }
        layer.close(DbMode::NORMAL | DbMode::NO_DBTHREADS).unwrap();
    }
}

#[test]
fn repeated_checkpoints_keep_data_and_a_clean_restart() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"dc=example");

    layer.checkpoint(true).unwrap();
    layer.checkpoint(true).unwrap();
    layer.checkpoint(false).unwrap();
    layer.close(DbMode::NORMAL).unwrap();

    layer.start(DbMode::NORMAL).unwrap();
    assert!(!layer.recovery_required());
    assert_eq!(read(&layer, &instance, b"1").as_deref(), Some(&b"dc=example"[..]));
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn committed_work_survives_an_unclean_shutdown() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"first");
    write(&layer, &instance, b"2", b"second");
    layer.close(DbMode::NORMAL).unwrap();
    std::fs::remove_file(dir.path().join(GUARDIAN_FILE)).unwrap();

    layer.start(DbMode::NORMAL).unwrap();
    assert!(layer.recovery_required());
    assert_eq!(read(&layer, &instance, b"1").as_deref(), Some(&b"first"[..]));
    assert_eq!(read(&layer, &instance, b"2").as_deref(), Some(&b"second"[..]));
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn erase_waits_for_references_to_drain() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    let reference = layer.get_index(&instance, "cn", true).unwrap();
    reference.put(None, b"alice", b"1").unwrap();

    let eraser = {
        let layer = layer.clone();
        let instance = Arc::clone(&instance);
        thread::spawn(move || layer.erase_index(&instance, "cn"))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!eraser.is_finished());
    assert_eq!(instance.index_status("cn"), Some(IndexStatus::OfflineDraining));
    assert!(matches!(
        layer.get_index(&instance, "cn", false),
        Err(DbError::Busy { .. })
    ));

    drop(reference);
    eraser.join().unwrap().unwrap();
    assert!(matches!(
        layer.get_index(&instance, "cn", false),
        Err(DbError::DatabaseNotFound { .. })
    ));
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn erase_waits_for_every_holding_thread() {
    const HOLDERS: usize = 6;
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    layer.get_index(&instance, "cn", true).unwrap();

    let holding = Arc::new(Barrier::new(HOLDERS + 1));
    let release = Arc::new(Barrier::new(HOLDERS + 1));
    let holders: Vec<_> = (0..HOLDERS)
        .map(|_| {
            let layer = layer.clone();
            let instance = Arc::clone(&instance);
            let holding = Arc::clone(&holding);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let reference = layer.get_index(&instance, "cn", false).unwrap();
                holding.wait();
                release.wait();
                drop(reference);
            })
        })
        .collect();
    holding.wait();

    let eraser = {
        let layer = layer.clone();
        let instance = Arc::clone(&instance);
        thread::spawn(move || layer.erase_index(&instance, "cn"))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!eraser.is_finished());
    assert_eq!(instance.index_status("cn"), Some(IndexStatus::OfflineDraining));
    assert!(matches!(
        layer.get_index(&instance, "cn", false),
        Err(DbError::Busy { .. })
    ));

    release.wait();
    for holder in holders {
        holder.join().unwrap();
    }
    eraser.join().unwrap().unwrap();
    assert!(matches!(
        layer.get_index(&instance, "cn", false),
        Err(DbError::DatabaseNotFound { .. })
    ));
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn full_disk_fails_the_commit_and_leaves_no_guardian() {
    let dir = tempdir().unwrap();
    let layer = DbLayer::init(config(dir.path())).unwrap();
    let segments = Arc::new(MemorySegments::new());
    layer.set_log_store(segments.clone());
    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = Arc::clone(&notified);
        layer.on_disk_full(move |_| {
            notified.fetch_add(1, Ordering::SeqCst);
        });
    }
    layer.start(DbMode::NORMAL | DbMode::NO_DBTHREADS).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"fits");

    segments.set_full(true);
    let txn = layer.txn_begin(&instance, None).unwrap();
    {
        let db = layer.get_primary(&instance).unwrap();
        db.put(txn.handle(), b"2", b"does not fit").unwrap();
    }
    let err = layer.txn_commit(&instance, Some(&txn)).unwrap_err();
    assert!(err.is_disk_full());
    assert_eq!(layer.disk_full_events(), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(layer.bad_stuff_happened());

    let _ = layer.close(DbMode::NORMAL | DbMode::NO_DBTHREADS);
    assert!(!dir.path().join(GUARDIAN_FILE).exists());
}
