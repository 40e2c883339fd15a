// Deduplication chains, batch deletion with link preservation and the
// retention policies of purge.

mod common;

use common::TestEnv;

use rusty_backup::metadata::backup::check_size_invariants;
use rusty_backup::metadata::BackupState;
use rusty_backup::{BackupOptions, BackupSources};

fn backup_options(name: &str) -> BackupOptions {
    BackupOptions {
        name: name.to_string(),
        ..BackupOptions::default()
    }
}

fn full_sources() -> BackupSources {
    BackupSources::for_backup(false, false)
}

#[test]
fn test_dedup_chain_and_partial_delete() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");
    env.control
        .add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"immutable payload")]);

    let engine = env.engine();
    engine.backup(full_sources(), backup_options("b1")).unwrap();
    engine.backup(full_sources(), backup_options("b2")).unwrap();

    let b1 = engine.get("b1").unwrap();
    let b2 = engine.get("b2").unwrap();

    // The unchanged part is linked, not re-uploaded.
    assert_eq!(b2.real_size, 0);
    assert_eq!(b2.size, b1.size);
    assert!(check_size_invariants(&b2));
    let part = b2.find_part("db1", "t1", "all_1_1_0").unwrap();
    assert_eq!(part.link(), Some(b1.path.as_str()));
    // b1 still owns its bytes.
    assert!(env
        .storage_object("backups/b1/data/db1/t1/all_1_1_0.tar")
        .is_file());
    assert!(!env
        .storage_object("backups/b2/data/db1/t1/all_1_1_0.tar")
        .exists());

    // Deleting b1 must keep the payload b2 links to.
    let (deleted, msg) = engine.delete("b1", false).unwrap();
    assert!(deleted.is_none());
    assert!(msg.is_some());

    let b1 = engine.get("b1").unwrap();
    assert_eq!(b1.state(), BackupState::PartiallyDeleted);
    assert!(env
        .storage_object("backups/b1/data/db1/t1/all_1_1_0.tar")
        .is_file());

    // b2 remains fully usable.
    let b2 = engine.get("b2").unwrap();
    assert_eq!(b2.state(), BackupState::Created);
    assert_eq!(b2.find_part("db1", "t1", "all_1_1_0").unwrap().link(), Some("backups/b1"));
}

#[test]
fn test_delete_without_references_removes_everything() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");
    env.control.add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"payload")]);

    let engine = env.engine();
    engine.backup(full_sources(), backup_options("b1")).unwrap();

    let (deleted, msg) = engine.delete("b1", false).unwrap();
    assert_eq!(deleted.as_deref(), Some("b1"));
    assert!(msg.is_none());

    assert!(engine.get("b1").is_err());
    assert!(!env.storage_object("backups/b1").exists());
}

#[test]
fn test_changed_part_is_not_deduplicated() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");
    env.control.add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"version one")]);

    let engine = env.engine();
    engine.backup(full_sources(), backup_options("b1")).unwrap();

    // Same part name, different content.
    env.control.add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"version TWO")]);
    engine.backup(full_sources(), backup_options("b2")).unwrap();

    let b2 = engine.get("b2").unwrap();
    let part = b2.find_part("db1", "t1", "all_1_1_0").unwrap();
    assert_eq!(part.link(), None);
    assert!(b2.real_size > 0);
}

#[test]
fn test_missing_candidate_payload_forces_fresh_upload() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");
    env.control.add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"payload")]);

    let engine = env.engine();
    engine.backup(full_sources(), backup_options("b1")).unwrap();

    // The candidate's payload vanishes from storage; verification must
    // drop the dedup entry and upload fresh.
    std::fs::remove_file(env.storage_object("backups/b1/data/db1/t1/all_1_1_0.tar")).unwrap();

    engine.backup(full_sources(), backup_options("b2")).unwrap();
    let b2 = engine.get("b2").unwrap();
    let part = b2.find_part("db1", "t1", "all_1_1_0").unwrap();
    assert_eq!(part.link(), None);
    assert!(env
        .storage_object("backups/b2/data/db1/t1/all_1_1_0.tar")
        .is_file());
}

#[test]
fn test_schema_only_backup_is_not_a_dedup_source() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");
    env.control.add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"payload")]);

    let engine = env.engine();
    engine
        .backup(BackupSources::for_backup(true, false), backup_options("b1"))
        .unwrap();
    engine.backup(full_sources(), backup_options("b2")).unwrap();

    let b2 = engine.get("b2").unwrap();
    let part = b2.find_part("db1", "t1", "all_1_1_0").unwrap();
    assert_eq!(part.link(), None);
    assert!(b2.real_size > 0);
}

#[test]
fn test_purge_retain_count() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");

    // Dedup off: every backup owns all of its bytes, so nothing links
    // into the deleted set and purge removes backups entirely.
    let mut config = env.config.clone();
    config.backup.deduplicate_parts = false;
    config.backup.retain_count = Some(2);
    config.backup.retain_time_secs = 0;
    let engine = rusty_backup::BackupEngine::new(config, env.control.clone(), None).unwrap();

    for (i, name) in ["b1", "b2", "b3", "b4", "b5"].iter().enumerate() {
        env.control.add_part(
            "db1",
            "t1",
            &format!("all_{}_{}_0", i + 1, i + 1),
            &[("data.bin", format!("payload {}", i).as_bytes())],
        );
        engine.backup(full_sources(), backup_options(name)).unwrap();
        // Make the ordering unambiguous.
        env.age_backup(name, (5 - i as i64) * 86400);
    }

    let (deleted, msg) = engine.purge().unwrap();
    assert!(msg.is_none());
    let mut deleted = deleted;
    deleted.sort();
    assert_eq!(deleted, vec!["b1", "b2", "b3"]);

    let survivors: Vec<String> = engine
        .list(None)
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(survivors, vec!["b5", "b4"]);
}

#[test]
fn test_purge_retain_time() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");

    let mut config = env.config.clone();
    config.backup.deduplicate_parts = false;
    // Keep anything younger than 2.5 days: b3 (1d) and b2 (2d).
    config.backup.retain_time_secs = 86400 * 5 / 2;
    config.backup.retain_count = None;
    let engine = rusty_backup::BackupEngine::new(config, env.control.clone(), None).unwrap();

    for (i, name) in ["b1", "b2", "b3"].iter().enumerate() {
        env.control.add_part(
            "db1",
            "t1",
            &format!("all_{}_{}_0", i + 1, i + 1),
            &[("data.bin", format!("payload {}", i).as_bytes())],
        );
        engine.backup(full_sources(), backup_options(name)).unwrap();
        env.age_backup(name, (3 - i as i64) * 86400);
    }

    let (deleted, _) = engine.purge().unwrap();
    assert_eq!(deleted, vec!["b1"]);

    let survivors: Vec<String> = engine
        .list(None)
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(survivors, vec!["b3", "b2"]);
}

#[test]
fn test_purge_preserves_linked_parts() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");
    env.control.add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"shared payload")]);

    let engine = env.engine();
    engine.backup(full_sources(), backup_options("b1")).unwrap();
    engine.backup(full_sources(), backup_options("b2")).unwrap();
    env.age_backup("b1", 10 * 86400);

    let mut config = env.config.clone();
    config.backup.retain_time_secs = 5 * 86400;
    config.backup.retain_count = None;
    let purge_engine = rusty_backup::BackupEngine::new(config, env.control.clone(), None).unwrap();

    // b1 falls out of the retention window, but b2 links to its part.
    let (deleted, _) = purge_engine.purge().unwrap();
    assert!(deleted.is_empty());

    let b1 = purge_engine.get("b1").unwrap();
    assert_eq!(b1.state(), BackupState::PartiallyDeleted);
    assert!(env
        .storage_object("backups/b1/data/db1/t1/all_1_1_0.tar")
        .is_file());
    assert_eq!(purge_engine.get("b2").unwrap().state(), BackupState::Created);
}

#[test]
fn test_purge_without_policies_is_noop() {
    let env = TestEnv::new();
    env.control.add_table("db1", "t1");
    env.control.add_part("db1", "t1", "all_1_1_0", &[("data.bin", b"payload")]);

    let engine = env.engine();
    engine.backup(full_sources(), backup_options("b1")).unwrap();

    let (deleted, msg) = engine.purge().unwrap();
    assert!(deleted.is_empty());
    assert!(msg.is_some());
    assert!(engine.get("b1").is_ok());
}
