//! Backup, restore and archive round trips.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dblayer_core::backup::MANIFEST_FILE;
use dblayer_core::dbversion::DBVERSION_FILE;
use dblayer_core::engine::Environment;
use dblayer_core::guardian::{restore_marker, GUARDIAN_FILE};
use dblayer_core::{
    ArchiveLister, BackupManifest, DbError, DbLayer, DbLayerConfig, DbMode, DbResult, DbValue,
    Instance, LogLister, RestoreOptions,
};
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

/// Drops the oldest log from the list on chosen calls, as if the log had
/// been trimmed between the two listings of an attempt.
struct SwipingLister {
    calls: AtomicUsize,
    swipe: fn(usize) -> bool,
}

impl SwipingLister {
    fn new(swipe: fn(usize) -> bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            swipe,
        }
    }
}

impl LogLister for SwipingLister {
    fn list(&self, env: &Environment) -> DbResult<Vec<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut names = ArchiveLister.list(env)?;
        if (self.swipe)(call) && !names.is_empty() {
            names.remove(0);
        }
        Ok(names)
    }
}

#[test]
fn backup_then_restore_brings_back_the_backed_up_state() {
    let root = tempdir().unwrap();
    let home = root.path().join("db");
    let dest = root.path().join("bak");
    let layer = DbLayer::init(config(&home)).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"dc=example,dc=com");

    let report = layer.backup(&dest).unwrap();
    assert_eq!(report.attempts, 1);
    assert!(!report.logs.is_empty());
    assert!(dest.join("userRoot").join("id2entry.db").is_file());
    assert!(dest.join(DBVERSION_FILE).is_file());
    for log in &report.logs {
        assert!(dest.join(log).is_file());
    }
    let manifest = BackupManifest::read(&dest).unwrap().unwrap();
    assert!(manifest
        .instance("userRoot")
        .is_some_and(|entry| entry.indexes.iter().any(|i| i == "id2entry")));
    assert!(dest.join(MANIFEST_FILE).is_file());

    write(&layer, &instance, b"2", b"ou=people,dc=example,dc=com");
    layer.close(DbMode::NORMAL).unwrap();

    let restored = layer.restore(&dest, &RestoreOptions::new()).unwrap();
    assert!(restored.logs_restored);
    assert!(layer.is_started());
    assert_eq!(
        read(&layer, &instance, b"1").as_deref(),
        Some(&b"dc=example,dc=com"[..])
    );
    assert_eq!(read(&layer, &instance, b"2"), None);
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn backup_restores_into_a_fresh_environment() {
    let root = tempdir().unwrap();
    let dest = root.path().join("bak");
    let source = DbLayer::init(config(&root.path().join("source"))).unwrap();
    source.start(DbMode::NORMAL).unwrap();
    let instance = source.add_instance("userRoot").unwrap();
    let records: Vec<(Vec<u8>, Vec<u8>)> = (0..20)
        .map(|i| (format!("{i:04}").into_bytes(), format!("uid=user{i},dc=example").into_bytes()))
        .collect();
    for (key, value) in &records {
        write(&source, &instance, key, value);
    }
    source.backup(&dest).unwrap();
    source.close(DbMode::NORMAL).unwrap();

    let target = DbLayer::init(config(&root.path().join("target"))).unwrap();
    let copy = target.add_instance("userRoot").unwrap();
    target.restore(&dest, &RestoreOptions::new()).unwrap();
    for (key, value) in &records {
        assert_eq!(read(&target, &copy, key).as_ref(), Some(value));
    }
    target.close(DbMode::NORMAL).unwrap();
}

#[test]
fn backup_taken_under_load_restores_a_committed_prefix() {
    let root = tempdir().unwrap();
    let dest = root.path().join("bak");
    let source = DbLayer::init(
        config(&root.path().join("source")).with_logfile_size(64 * 1024),
    )
    .unwrap();
    source.start(DbMode::NORMAL).unwrap();
    let instance = source.add_instance("userRoot").unwrap();
    let key = |i: usize| format!("{i:08}").into_bytes();

    let stop = Arc::new(AtomicBool::new(false));
    let committed = Arc::new(AtomicUsize::new(0));
    let writer = {
        let (layer, instance) = (source.clone(), Arc::clone(&instance));
        let (stop, committed) = (Arc::clone(&stop), Arc::clone(&committed));
        thread::spawn(move || {
            let mut i = 0;
            while !stop.load(Ordering::SeqCst) {
                write(&layer, &instance, &key(i), &[b'x'; 256]);
                i += 1;
                committed.store(i, Ordering::SeqCst);
            }
        })
    };
    let checkpointer = {
        let (layer, stop) = (source.clone(), Arc::clone(&stop));
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                layer.checkpoint(true).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    thread::sleep(Duration::from_millis(200));
    let before = committed.load(Ordering::SeqCst);
    source.backup(&dest).unwrap();
    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();
    checkpointer.join().unwrap();
    let total = committed.load(Ordering::SeqCst);
    source.close(DbMode::NORMAL).unwrap();
    assert!(before > 0);

    let target = DbLayer::init(config(&root.path().join("target"))).unwrap();
    let copy = target.add_instance("userRoot").unwrap();
    target.restore(&dest, &RestoreOptions::new()).unwrap();
    let present = (0..total)
        .take_while(|&i| read(&target, &copy, &key(i)).is_some())
        .count();
    assert!(present >= before, "restored {present} of {before} committed");
    for i in present..total {
        assert_eq!(read(&target, &copy, &key(i)), None, "key {i} restored after a missing one");
    }
    target.close(DbMode::NORMAL).unwrap();
}

#[test]
fn restore_while_running_is_refused() {
    let root = tempdir().unwrap();
    let home = root.path().join("db");
    let dest = root.path().join("bak");
    let layer = DbLayer::init(config(&home)).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    layer.backup(&dest).unwrap();
    assert!(matches!(
        layer.restore(&dest, &RestoreOptions::new()),
        Err(DbError::Busy { .. })
    ));
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn swiped_log_makes_the_backup_try_again() {
    let root = tempdir().unwrap();
    let layer = DbLayer::init(config(&root.path().join("db"))).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"entry");

    let lister = SwipingLister::new(|call| call == 1);
    let report = layer.backup_with(&root.path().join("bak"), &lister).unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(lister.calls.load(Ordering::SeqCst), 4);
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn logs_that_never_hold_still_exhaust_the_retries() {
    let root = tempdir().unwrap();
    let mut config = config(&root.path().join("db"));
    config.backup_retries = 3;
    let layer = DbLayer::init(config).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"entry");

    let lister = SwipingLister::new(|call| call % 2 == 1);
    assert!(matches!(
        layer.backup_with(&root.path().join("bak"), &lister),
        Err(DbError::Busy { .. })
    ));
    assert_eq!(lister.calls.load(Ordering::SeqCst), 6);
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn shutdown_aborts_a_backup() {
    let root = tempdir().unwrap();
    let layer = DbLayer::init(config(&root.path().join("db"))).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    layer.request_shutdown();
    assert!(matches!(
        layer.backup(&root.path().join("bak")),
        Err(DbError::Shutdown)
    ));
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn single_instance_restore_leaves_the_others_alone() {
    let root = tempdir().unwrap();
    let home = root.path().join("db");
    let dest = root.path().join("bak");
    let layer = DbLayer::init(config(&home)).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let people = layer.add_instance("people").unwrap();
    let groups = layer.add_instance("groups").unwrap();
    write(&layer, &people, b"1", b"alice");
    write(&layer, &groups, b"1", b"admins");
    layer.backup(&dest).unwrap();
    write(&layer, &people, b"2", b"bob");
    write(&layer, &groups, b"2", b"users");
    layer.close(DbMode::NORMAL).unwrap();

    let report = layer
        .restore(&dest, &RestoreOptions::new().with_instance("people"))
        .unwrap();
    assert!(!report.logs_restored);
    assert!(report.mode.contains(DbMode::RESTORE_NO_RECOVERY));
    assert!(!root.path().join("db.restore-staging").exists());
    assert!(!root.path().join("db.restore-reset").exists());

    assert_eq!(read(&layer, &people, b"1").as_deref(), Some(&b"alice"[..]));
    assert_eq!(read(&layer, &people, b"2"), None);
    assert_eq!(read(&layer, &groups, b"1").as_deref(), Some(&b"admins"[..]));
    assert_eq!(read(&layer, &groups, b"2").as_deref(), Some(&b"users"[..]));
    layer.close(DbMode::RESTORE_NO_RECOVERY).unwrap();
}

#[test]
fn offline_archive_keeps_the_guardian_untouched() {
    let root = tempdir().unwrap();
    let home = root.path().join("db");
    let dest = root.path().join("archive");
    let layer = DbLayer::init(config(&home)).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"entry");
    layer.close(DbMode::NORMAL).unwrap();
    let guardian = fs::read(home.join(GUARDIAN_FILE)).unwrap();

    layer.db2archive(&dest, true).unwrap();
    assert!(!layer.is_started());
    assert!(dest.join(DBVERSION_FILE).is_file());
    assert!(dest.join("userRoot").join("id2entry.db").is_file());
    assert_eq!(fs::read(home.join(GUARDIAN_FILE)).unwrap(), guardian);
}

#[test]
fn archiving_twice_keeps_the_previous_archive_aside() {
    let root = tempdir().unwrap();
    let home = root.path().join("db");
    let dest = root.path().join("archive");
    let layer = DbLayer::init(config(&home)).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"entry");

    layer.db2archive(&dest, false).unwrap();
    layer.db2archive(&dest, false).unwrap();
    assert!(dest.join(DBVERSION_FILE).is_file());
    assert!(root.path().join("archive.bak").join(DBVERSION_FILE).is_file());
    assert!(!instance.is_busy());
    layer.close(DbMode::NORMAL).unwrap();
}

#[test]
fn online_archive_restore_restarts_and_marks_success() {
    let root = tempdir().unwrap();
    let home = root.path().join("db");
    let dest = root.path().join("archive");
    let layer = DbLayer::init(config(&home)).unwrap();
    layer.start(DbMode::NORMAL).unwrap();
    let instance = layer.add_instance("userRoot").unwrap();
    write(&layer, &instance, b"1", b"kept");
    layer.db2archive(&dest, false).unwrap();
    write(&layer, &instance, b"2", b"lost");

    layer.archive2db(&dest, &RestoreOptions::new()).unwrap();
    assert!(layer.is_started());
    assert!(!instance.is_busy());
    let marker = fs::read_to_string(restore_marker(&home)).unwrap();
    assert!(marker.contains("succeeded"));
    assert_eq!(read(&layer, &instance, b"1").as_deref(), Some(&b"kept"[..]));
    assert_eq!(read(&layer, &instance, b"2"), None);
    layer.close(DbMode::NORMAL).unwrap();
}
