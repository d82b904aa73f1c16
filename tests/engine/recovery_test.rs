use std::fs::OpenOptions;

use sandi::{
    DatabaseError, ErrorKind,
    cipher::{PageCodec, derive_key, generate_salt},
    storage::{
        header::{DatabaseHeader, FileHeader},
        page_store::PageStore,
        wal::{WAL_HEADER_SIZE, Wal},
    },
    types::{DEFAULT_PAGE_SIZE, FILE_HEADER_SIZE, MIN_KDF_ITERATIONS},
    utils::mock::TempDatabase,
};

fn wal_len(temp: &TempDatabase) -> u64 {
    std::fs::metadata(temp.wal_path()).unwrap().len()
}

fn write_one(db: &sandi::Database, key: &[u8], value: &[u8]) {
    let mut txn = db.begin_write().unwrap();
    txn.put(key, value).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_committed_data_survives_crash() {
    let temp = TempDatabase::new().unwrap();
    {
        let db = temp.open("secret").unwrap();
        write_one(&db, b"durable", b"yes");
        // Dropped without close: the commit lives only in the log
    }
    assert!(wal_len(&temp) > WAL_HEADER_SIZE);

    let db = temp.open("secret").unwrap();
    assert_eq!(db.begin_read().unwrap().get(b"durable").unwrap(), Some(b"yes".to_vec()));
    // Recovered frames were checkpointed on open
    assert_eq!(wal_len(&temp), WAL_HEADER_SIZE);
    db.integrity_check().unwrap();
}

#[test]
fn test_frames_without_commit_are_ignored() {
    let temp = TempDatabase::new().unwrap();
    let last_committed = {
        let db = temp.open("secret").unwrap();
        write_one(&db, b"k", b"committed");
        db.stats().unwrap().last_committed
    };

    {
        // A writer that crashed after appending its pages
        let mut wal = Wal::open(temp.wal_path(), DEFAULT_PAGE_SIZE).unwrap();
        wal.recover().unwrap();
        wal.append(last_committed + 1, 1, &vec![0xEE; DEFAULT_PAGE_SIZE]).unwrap();
        wal.append(last_committed + 1, 0, &vec![0xEE; DEFAULT_PAGE_SIZE]).unwrap();
    }

    let db = temp.open("secret").unwrap();
    let txn = db.begin_read().unwrap();
    assert_eq!(txn.get(b"k").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(txn.snapshot(), last_committed);
}

#[test]
fn test_torn_commit_is_rolled_back() {
    let temp = TempDatabase::new().unwrap();
    {
        let db = temp.open("secret").unwrap();
        write_one(&db, b"first", b"1");
        write_one(&db, b"second", b"2");
    }
    let file = OpenOptions::new().write(true).open(temp.wal_path()).unwrap();
    file.set_len(wal_len(&temp) - 5).unwrap();
    drop(file);

    let db = temp.open("secret").unwrap();
    let txn = db.begin_read().unwrap();
    assert_eq!(txn.get(b"first").unwrap(), Some(b"1".to_vec()));
    assert_eq!(txn.get(b"second").unwrap(), None);
    drop(txn);

    // New commits continue after the recovered one
    write_one(&db, b"third", b"3");
    assert_eq!(db.integrity_check().unwrap().entries, 2);
}

#[test]
fn test_repeated_crashes() {
    let temp = TempDatabase::new().unwrap();
    for round in 0..5u32 {
        let db = temp.open("secret").unwrap();
        assert_eq!(db.integrity_check().unwrap().entries, round as u64);
        write_one(&db, &round.to_be_bytes(), b"round");
    }
    let db = temp.open("secret").unwrap();
    assert_eq!(db.integrity_check().unwrap().entries, 5);
}

#[test]
fn test_tampered_page_fails_closed() {
    let temp = TempDatabase::new().unwrap();
    {
        let db = temp.open("secret").unwrap();
        write_one(&db, b"k", b"v");
        db.close().unwrap();
    }
    // Page 1 is the root leaf of a single-record tree
    let mut bytes = std::fs::read(temp.path()).unwrap();
    bytes[DEFAULT_PAGE_SIZE + 100] ^= 0x20;
    std::fs::write(temp.path(), &bytes).unwrap();

    let db = temp.open("secret").unwrap();
    let txn = db.begin_read().unwrap();
    let error = txn.get(b"k").unwrap_err();
    assert!(matches!(error, DatabaseError::AuthenticationFailure { page_id: 1 }));
    assert_eq!(error.kind(), ErrorKind::AuthenticationFailure);
    drop(txn);
    assert!(db.integrity_check().is_err());
}

#[test]
fn test_tampered_header_refuses_to_open() {
    let temp = TempDatabase::new().unwrap();
    {
        let db = temp.open("secret").unwrap();
        db.close().unwrap();
    }
    let mut bytes = std::fs::read(temp.path()).unwrap();
    bytes[200] ^= 0x01;
    std::fs::write(temp.path(), &bytes).unwrap();

    assert!(matches!(
        temp.open("secret"),
        Err(DatabaseError::AuthenticationFailure { page_id: 0 })
    ));
}

#[test]
fn test_rekey_survives_crash_before_checkpoint() {
    let temp = TempDatabase::new().unwrap();
    {
        let db = temp.open("secret").unwrap();
        let mut txn = db.begin_write().unwrap();
        for id in 0..300u32 {
            txn.put(&id.to_be_bytes(), b"payload").unwrap();
        }
        txn.commit().unwrap();
        drop(txn);
        db.close().unwrap();
    }

    // Log a rekey transaction the way a rekey does, then stop before the
    // checkpoint: the main file is still sealed with the old key.
    {
        let image = PageStore::read_header_image(temp.path()).unwrap();
        let old_header = FileHeader::from_bytes(&image[..FILE_HEADER_SIZE]).unwrap();
        let old_key = derive_key(b"secret", &old_header.salt, old_header.kdf_iterations).unwrap();
        let mut store = PageStore::open(temp.path(), PageCodec::new(&old_key), old_header).unwrap();

        let mut header = DatabaseHeader::from_body(&store.read_page(0).unwrap()).unwrap();
        header.last_txn_id += 1;
        header.change_counter += 1;
        let txn_id = header.last_txn_id;
        let mut plaintexts = vec![header.to_body(DEFAULT_PAGE_SIZE).unwrap()];
        for page_id in 1..header.page_count {
            plaintexts.push(store.read_page(page_id).unwrap());
        }

        let salt = generate_salt();
        let new_key = derive_key(b"fresh", &salt, MIN_KDF_ITERATIONS).unwrap();
        store.rekey(
            PageCodec::new(&new_key),
            FileHeader::new(DEFAULT_PAGE_SIZE, MIN_KDF_ITERATIONS, salt),
        );

        let mut wal = Wal::open(temp.wal_path(), DEFAULT_PAGE_SIZE).unwrap();
        wal.recover().unwrap();
        for (page_id, plaintext) in plaintexts.iter().enumerate() {
            let image = store.encode_page(page_id as u64, plaintext).unwrap();
            wal.append(txn_id, page_id as u64, &image).unwrap();
        }
        wal.commit(txn_id).unwrap();
    }
    assert!(wal_len(&temp) > WAL_HEADER_SIZE);

    assert!(matches!(
        temp.open("secret"),
        Err(DatabaseError::AuthenticationFailure { page_id: 0 })
    ));
    let db = temp.open("fresh").unwrap();
    assert_eq!(db.integrity_check().unwrap().entries, 300);
    let txn = db.begin_read().unwrap();
    assert_eq!(txn.get(&42u32.to_be_bytes()).unwrap(), Some(b"payload".to_vec()));
    drop(txn);
    db.close().unwrap();

    // The checkpoint on open moved everything to the new key
    let db = temp.open("fresh").unwrap();
    assert_eq!(db.stats().unwrap().wal_frames, 0);
}
