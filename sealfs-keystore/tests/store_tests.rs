//! Contract tests run against every KeyStore implementation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use pretty_assertions::assert_eq;
use sealfs_crypto::{KdfParams, generate_keypair, protect_private_key, seal_key};
use sealfs_keystore::{
    DuckDbKeyStore, FileId, FileKeyMarker, FileMigrationStatus, KeyMode, KeyStore, KeyStoreError,
    MemoryKeyStore, MigrationState, PrincipalId, ShareKeyRecord, StoredKeypair, SystemState,
};

fn keypair() -> StoredKeypair {
    let kp = generate_keypair();
    StoredKeypair {
        public_key: kp.public_bytes(),
        protected: protect_private_key(&kp.secret, "pw1", &KdfParams::testing()).unwrap(),
        created_at: Utc::now(),
    }
}

fn marker(file: &str, version: u32) -> FileKeyMarker {
    FileKeyMarker {
        file_id: FileId::from(file),
        current_version: version,
        owner: PrincipalId::from("alice"),
        mode: KeyMode::PerUser,
        updated_at: Utc::now(),
    }
}

fn record(file: &str, version: u32, principal: &str) -> ShareKeyRecord {
    let kp = generate_keypair();
    ShareKeyRecord {
        file_id: FileId::from(file),
        version,
        principal: PrincipalId::from(principal),
        envelope: seal_key(&[version as u8; 32], &kp.public).unwrap(),
    }
}

fn principals(names: &[&str]) -> BTreeSet<PrincipalId> {
    names.iter().map(|n| PrincipalId::from(*n)).collect()
}

fn stores() -> Vec<(&'static str, Box<dyn KeyStore>)> {
    vec![
        ("memory", Box::new(MemoryKeyStore::new())),
        ("duckdb", Box::new(DuckDbKeyStore::open_in_memory().unwrap())),
    ]
}

// ── Keypairs ──

#[test]
fn keypair_put_get_overwrite_delete() {
    for (name, store) in stores() {
        let alice = PrincipalId::from("alice");
        assert!(store.get_keypair(&alice).unwrap_err().is_not_found(), "{name}");

        let first = keypair();
        store.put_keypair(&alice, &first).unwrap();
        assert_eq!(store.get_keypair(&alice).unwrap(), first, "{name}");

        let second = keypair();
        store.put_keypair(&alice, &second).unwrap();
        assert_eq!(store.get_keypair(&alice).unwrap(), second, "{name}");
        assert_eq!(store.list_principals().unwrap(), vec![alice.clone()], "{name}");

        store.delete_keypair(&alice).unwrap();
        assert!(store.get_keypair(&alice).unwrap_err().is_not_found(), "{name}");
        assert!(store.delete_keypair(&alice).is_err(), "{name}");
    }
}

// ── Share key record sets ──

#[test]
fn record_set_is_replaced_whole() {
    for (name, store) in stores() {
        let f = FileId::from("f1");
        store
            .put_share_key_records(&marker("f1", 1), &[record("f1", 1, "alice"), record("f1", 1, "bob")])
            .unwrap();
        assert_eq!(
            store.list_principals_for_file(&f).unwrap(),
            principals(&["alice", "bob"]),
            "{name}"
        );

        store
            .put_share_key_records(&marker("f1", 1), &[record("f1", 1, "alice"), record("f1", 1, "carol")])
            .unwrap();
        assert_eq!(
            store.list_principals_for_file(&f).unwrap(),
            principals(&["alice", "carol"]),
            "{name}"
        );
        assert!(store.get_file_key_record(&f, &PrincipalId::from("bob")).unwrap_err().is_not_found());
    }
}

#[test]
fn newer_version_drops_old_records_and_moves_pointer() {
    for (name, store) in stores() {
        let f = FileId::from("f1");
        store
            .put_share_key_records(&marker("f1", 1), &[record("f1", 1, "alice"), record("f1", 1, "bob")])
            .unwrap();
        store
            .put_share_key_records(&marker("f1", 2), &[record("f1", 2, "alice")])
            .unwrap();

        assert_eq!(store.get_file_marker(&f).unwrap().current_version, 2, "{name}");
        let records = store.list_share_key_records(&f).unwrap();
        assert_eq!(records.len(), 1, "{name}");
        assert_eq!(records[0].version, 2, "{name}");

        let stale = store.put_share_key_records(&marker("f1", 1), &[record("f1", 1, "alice")]);
        assert!(matches!(stale, Err(KeyStoreError::InvalidRecordSet(_))), "{name}");
        assert_eq!(store.get_file_marker(&f).unwrap().current_version, 2, "{name}");
    }
}

#[test]
fn invalid_set_leaves_previous_state() {
    for (name, store) in stores() {
        let f = FileId::from("f1");
        let original = [record("f1", 1, "alice"), record("f1", 1, "bob")];
        store.put_share_key_records(&marker("f1", 1), &original).unwrap();

        let mixed = [record("f1", 2, "alice"), record("f1", 1, "carol")];
        assert!(store.put_share_key_records(&marker("f1", 2), &mixed).is_err(), "{name}");

        assert_eq!(store.get_file_marker(&f).unwrap().current_version, 1, "{name}");
        assert_eq!(store.list_share_key_records(&f).unwrap(), original.to_vec(), "{name}");
    }
}

#[test]
fn delete_one_record_and_whole_file() {
    for (name, store) in stores() {
        let f = FileId::from("f1");
        store
            .put_share_key_records(&marker("f1", 1), &[record("f1", 1, "alice"), record("f1", 1, "bob")])
            .unwrap();

        store.delete_share_key_record(&f, &PrincipalId::from("bob")).unwrap();
        assert_eq!(store.list_principals_for_file(&f).unwrap(), principals(&["alice"]), "{name}");
        assert!(store
            .delete_share_key_record(&f, &PrincipalId::from("bob"))
            .unwrap_err()
            .is_not_found());

        store.delete_file_records(&f).unwrap();
        assert!(store.get_file_marker(&f).unwrap_err().is_not_found(), "{name}");
        assert!(store.list_principals_for_file(&f).unwrap().is_empty(), "{name}");
        assert!(store.list_files().unwrap().is_empty(), "{name}");
    }
}

#[test]
fn files_are_listed_in_order() {
    for (name, store) in stores() {
        for f in ["b", "a", "c"] {
            store.put_share_key_records(&marker(f, 1), &[record(f, 1, "alice")]).unwrap();
        }
        let files: Vec<_> = store.list_files().unwrap().into_iter().map(|f| f.to_string()).collect();
        assert_eq!(files, vec!["a", "b", "c"], "{name}");
    }
}

// ── System state ──

#[test]
fn system_state_defaults_and_roundtrips() {
    for (name, store) in stores() {
        assert_eq!(store.get_system_state().unwrap(), SystemState::default(), "{name}");

        let mut files = BTreeMap::new();
        files.insert(FileId::from("f1"), FileMigrationStatus::Done);
        files.insert(FileId::from("f2"), FileMigrationStatus::Failed("locked".into()));
        let state = SystemState {
            mode: KeyMode::PerUser,
            migration: Some(MigrationState {
                from: KeyMode::PerUser,
                to: KeyMode::MasterKey,
                started_at: Utc::now(),
                files,
            }),
            recovery_enabled: true,
            recovery_opt_out: principals(&["bob"]),
        };
        store.put_system_state(&state).unwrap();
        assert_eq!(store.get_system_state().unwrap(), state, "{name}");
    }
}

// ── Durability ──

#[test]
fn duckdb_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.duckdb");
    let alice = PrincipalId::from("alice");
    let kp = keypair();
    let records = [record("f1", 3, "alice")];

    {
        let store = DuckDbKeyStore::open(&path).unwrap();
        store.put_keypair(&alice, &kp).unwrap();
        store.put_share_key_records(&marker("f1", 3), &records).unwrap();
    }

    let store = DuckDbKeyStore::open(&path).unwrap();
    assert_eq!(store.get_keypair(&alice).unwrap(), kp);
    assert_eq!(store.get_file_marker(&FileId::from("f1")).unwrap().current_version, 3);
    assert_eq!(
        store.get_file_key_record(&FileId::from("f1"), &alice).unwrap(),
        records[0]
    );
}
