//! Plaintext streaming over encrypted blocks: seeking, tamper detection,
//! aborted writes and conversion of existing files.

mod support;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sealfs_crypto::TAG_SIZE;
use sealfs_engine::{
    AccessPolicy, Engine, EngineConfig, EngineError, FsStorage, HEADER_SIZE, HostStorage,
    MemoryAccessPolicy, PrincipalId, content_object,
};
use sealfs_keystore::{DuckDbKeyStore, KeyStore};
use support::{file, harness};

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Seekable reads ──

#[test]
fn seek_reads_only_the_requested_range() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    let data = sample(1000);
    h.write(&f1, &alice, &data);

    let mut reader = h.engine.interceptor().open_for_read(&f1, &alice).unwrap();
    assert_eq!(reader.len(), 1000);

    reader.seek(SeekFrom::Start(130)).unwrap();
    let mut buf = [0u8; 100];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &data[130..230]);

    reader.seek(SeekFrom::End(-10)).unwrap();
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &data[990..]);

    assert!(reader.seek(SeekFrom::Current(-2000)).is_err());
}

#[test]
fn block_aligned_and_empty_files_roundtrip() {
    let h = harness();
    let (_, alice) = h.user("alice");
    for len in [0usize, 64, 128, 65] {
        let f = file(&format!("f{len}"));
        let data = sample(len);
        h.write(&f, &alice, &data);
        assert_eq!(h.engine.read_to_end(&f, &alice).unwrap(), data, "len {len}");
        assert_eq!(h.engine.plaintext_size(&f).unwrap(), len as u64);
    }
}

#[test]
fn streaming_writes_match_one_shot_write() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.policy.grant(&f1, &PrincipalId::from("alice"));
    let data = sample(777);

    let mut writer = h.engine.open_for_write(&f1, &alice).unwrap();
    for chunk in data.chunks(13) {
        writer.write_all(chunk).unwrap();
    }
    writer.flush().unwrap();
    assert_eq!(writer.close().unwrap(), 777);

    assert_eq!(h.engine.read_to_end(&f1, &alice).unwrap(), data);
}

// ── Tamper detection ──

#[test]
fn tampered_block_is_inaccessible_not_missing() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.write(&f1, &alice, &sample(200));

    let second_block = HEADER_SIZE + 64 + TAG_SIZE + 3;
    h.storage.corrupt_byte(&content_object(&f1, 1), second_block).unwrap();

    let err = h.engine.read_to_end(&f1, &alice).unwrap_err();
    assert!(matches!(err, EngineError::AuthenticationFailed { block: 1, .. }), "{err}");
    assert!(err.is_inaccessible());
    assert!(!err.is_not_found());

    let missing = h.engine.read_to_end(&file("nope"), &alice).unwrap_err();
    assert!(missing.is_not_found());
}

#[test]
fn reader_stays_poisoned_after_a_failed_block() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    let data = sample(200);
    h.write(&f1, &alice, &data);
    h.storage
        .corrupt_byte(&content_object(&f1, 1), HEADER_SIZE + 64 + TAG_SIZE)
        .unwrap();

    let mut reader = h.engine.open_for_read(&f1, &alice).unwrap();
    let mut first = [0u8; 64];
    reader.read_exact(&mut first).unwrap();
    assert_eq!(&first[..], &data[..64]);

    let mut buf = [0u8; 16];
    assert!(reader.read(&mut buf).is_err());
    reader.seek(SeekFrom::Start(0)).unwrap();
    assert!(reader.read(&mut buf).is_err());
}

#[test]
fn damaged_header_is_corrupt() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.write(&f1, &alice, b"data");
    h.storage.corrupt_byte(&content_object(&f1, 1), 0).unwrap();

    assert!(matches!(
        h.engine.read_to_end(&f1, &alice),
        Err(EngineError::CorruptRecord(_))
    ));
}

#[test]
fn shortened_length_field_is_inaccessible() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.write(&f1, &alice, &sample(200));
    // Low byte of the plaintext length: claims a shorter file.
    h.storage.corrupt_byte(&content_object(&f1, 1), HEADER_SIZE - 1).unwrap();

    let err = h.engine.read_to_end(&f1, &alice).unwrap_err();
    assert!(err.is_inaccessible(), "{err}");
}

#[test]
fn header_claiming_a_huge_file_is_corrupt() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.write(&f1, &alice, &sample(200));
    // High byte of the plaintext length.
    h.storage.corrupt_byte(&content_object(&f1, 1), HEADER_SIZE - 8).unwrap();

    let err = h.engine.read_to_end(&f1, &alice).unwrap_err();
    assert!(matches!(err, EngineError::CorruptRecord(_)), "{err}");
    assert!(err.is_inaccessible());
    assert!(matches!(
        h.engine.plaintext_size(&f1),
        Err(EngineError::CorruptRecord(_))
    ));
}

#[test]
fn maximal_length_with_tiny_blocks_is_rejected_at_open() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.write(&f1, &alice, b"short");
    let object = content_object(&f1, 1);
    h.storage.write(&object, 12, &1u32.to_be_bytes()).unwrap();
    h.storage.write(&object, 24, &[0xff; 8]).unwrap();

    assert!(matches!(
        h.engine.open_for_read(&f1, &alice),
        Err(EngineError::CorruptRecord(_))
    ));
}

#[test]
fn object_size_disagreeing_with_header_is_corrupt() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    let data = sample(150);
    h.write(&f1, &alice, &data);
    let object = content_object(&f1, 1);
    let size = h.storage.size(&object).unwrap();

    // Trailing garbage after the final block.
    h.storage.write(&object, size, b"junk").unwrap();
    let err = h.engine.read_to_end(&f1, &alice).unwrap_err();
    assert!(matches!(err, EngineError::CorruptRecord(_)), "{err}");
    assert!(h.engine.plaintext_size(&f1).unwrap_err().is_inaccessible());

    // The original content is intact once the object is rewritten.
    h.write(&f1, &alice, &data);
    assert_eq!(h.engine.plaintext_size(&f1).unwrap(), 150);
    assert_eq!(h.engine.read_to_end(&f1, &alice).unwrap(), data);
}

// ── Aborted writes ──

#[test]
fn aborted_write_keeps_previous_content() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.write(&f1, &alice, b"committed");

    let mut writer = h.engine.open_for_write(&f1, &alice).unwrap();
    writer.write_plaintext(&sample(500)).unwrap();
    drop(writer);
    assert_eq!(h.engine.read_to_end(&f1, &alice).unwrap(), b"committed");

    let mut writer = h.engine.open_for_write(&f1, &alice).unwrap();
    writer.write_plaintext(b"half").unwrap();
    writer.abort();
    assert_eq!(h.engine.read_to_end(&f1, &alice).unwrap(), b"committed");

    assert!(h.staging_objects().is_empty());
}

#[test]
fn aborted_first_write_leaves_file_without_content() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.policy.grant(&f1, &PrincipalId::from("alice"));

    let writer = h.engine.open_for_write(&f1, &alice).unwrap();
    drop(writer);

    assert!(h.engine.read_to_end(&f1, &alice).unwrap_err().is_not_found());
    assert!(h.storage.objects().is_empty());
}

// ── Conversion ──

#[test]
fn existing_plaintext_is_encrypted_in_place_and_back() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let notes = file("notes.txt");
    let data = sample(300);
    h.storage.write("notes.txt", 0, &data).unwrap();
    h.policy.grant(&notes, &PrincipalId::from("alice"));

    assert_eq!(h.engine.encrypt_existing(&notes, &alice).unwrap(), 300);
    assert!(!h.storage.exists("notes.txt").unwrap());
    assert_eq!(h.engine.read_to_end(&notes, &alice).unwrap(), data);
    assert!(matches!(
        h.engine.encrypt_existing(&notes, &alice),
        Err(EngineError::InvalidState(_))
    ));

    assert_eq!(h.engine.decrypt_to_plaintext(&notes, &alice).unwrap(), 300);
    assert_eq!(h.storage.read("notes.txt", 0, 1000).unwrap(), data);
    assert!(h.store.get_file_marker(&notes).unwrap_err().is_not_found());
    assert!(h.engine.plaintext_size(&notes).unwrap_err().is_not_found());
    assert_eq!(h.storage.objects(), vec!["notes.txt".to_string()]);
}

#[test]
fn encrypting_a_missing_object_is_not_found() {
    let h = harness();
    let (_, alice) = h.user("alice");
    assert!(
        h.engine
            .encrypt_existing(&file("ghost.txt"), &alice)
            .unwrap_err()
            .is_not_found()
    );
}

#[test]
fn deleted_file_is_gone() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    h.write(&f1, &alice, b"data");

    h.engine.delete_file(&f1).unwrap();

    assert!(h.engine.read_to_end(&f1, &alice).unwrap_err().is_not_found());
    assert!(h.storage.objects().is_empty());
    assert!(h.engine.delete_file(&f1).unwrap_err().is_not_found());
}

// ── Rekey ──

#[test]
fn rekey_applies_new_block_size() {
    let h = harness();
    let (_, alice) = h.user("alice");
    let f1 = file("f1");
    let data = sample(400);
    h.write(&f1, &alice, &data);

    assert_eq!(h.engine.rekey_file(&f1, &alice).unwrap(), 2);
    assert_eq!(h.engine.read_to_end(&f1, &alice).unwrap(), data);
    assert_eq!(h.storage.objects(), vec!["f1@v2".to_string()]);
}

// ── On-disk stack ──

#[test]
fn duckdb_and_directory_storage_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("keys.duckdb");
    let objects = dir.path().join("objects");
    let policy = Arc::new(MemoryAccessPolicy::new());
    let alice = PrincipalId::from("alice");
    let f1 = file("reports/q3.txt");
    policy.grant(&f1, &alice);
    let data = sample(5000);

    let open = || {
        Engine::new(
            Arc::new(DuckDbKeyStore::open(&db).unwrap()) as Arc<dyn KeyStore>,
            Arc::new(FsStorage::open(&objects).unwrap()) as Arc<dyn HostStorage>,
            policy.clone() as Arc<dyn AccessPolicy>,
            EngineConfig::testing(),
        )
        .unwrap()
    };

    {
        let engine = open();
        engine.provision_principal(&alice, "pw1").unwrap();
        let session = engine.login(&alice, "pw1").unwrap();
        engine.write_all(&f1, &session, &data).unwrap();
    }

    let engine = open();
    let session = engine.login(&alice, "pw1").unwrap();
    assert_eq!(engine.read_to_end(&f1, &session).unwrap(), data);
    assert_eq!(engine.plaintext_size(&f1).unwrap(), 5000);
}

// ── Round-trip property ──

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_content_roundtrips(data in prop::collection::vec(any::<u8>(), 0..600)) {
        let h = harness();
        let (_, alice) = h.user("alice");
        let f1 = file("f1");
        h.write(&f1, &alice, &data);
        prop_assert_eq!(h.engine.read_to_end(&f1, &alice).unwrap(), data.clone());
        prop_assert_eq!(h.engine.plaintext_size(&f1).unwrap(), data.len() as u64);
    }
}
