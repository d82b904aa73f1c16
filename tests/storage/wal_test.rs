use std::fs::OpenOptions;

use sandi::{
    cipher::{PageCodec, derive_key},
    storage::{
        header::FileHeader,
        page_store::PageStore,
        wal::{FRAME_HEADER_SIZE, WAL_HEADER_SIZE, Wal, wal_path_for},
    },
    types::{MIN_KDF_ITERATIONS, error::DatabaseError},
    utils::mock::TempDatabase,
};

const PAGE_SIZE: usize = 1024;

fn image(fill: u8) -> Vec<u8> {
    vec![fill; PAGE_SIZE]
}

fn open_wal(temp: &TempDatabase) -> Wal {
    let mut wal = Wal::open(temp.wal_path(), PAGE_SIZE).unwrap();
    wal.recover().unwrap();
    wal
}

fn wal_len(temp: &TempDatabase) -> u64 {
    std::fs::metadata(temp.wal_path()).unwrap().len()
}

#[test]
fn test_wal_path_naming() {
    let path = std::path::Path::new("/tmp/app.db");
    assert_eq!(wal_path_for(path), std::path::PathBuf::from("/tmp/app.db-wal"));
}

#[test]
fn test_new_log_is_empty() {
    let temp = TempDatabase::new().unwrap();
    let wal = open_wal(&temp);
    assert_eq!(wal.frame_count(), 0);
    assert_eq!(wal.newest_commit(), None);
    assert_eq!(wal_len(&temp), WAL_HEADER_SIZE);
}

#[test]
fn test_append_before_recover_is_refused() {
    let temp = TempDatabase::new().unwrap();
    let mut wal = Wal::open(temp.wal_path(), PAGE_SIZE).unwrap();
    assert!(wal.append(1, 1, &image(1)).is_err());
}

#[test]
fn test_frames_invisible_until_commit() {
    let temp = TempDatabase::new().unwrap();
    let mut wal = open_wal(&temp);

    wal.append(1, 5, &image(1)).unwrap();
    assert_eq!(wal.read_page(5, 1).unwrap(), None);

    wal.commit(1).unwrap();
    assert_eq!(wal.read_page(5, 1).unwrap(), Some(image(1)));
    assert_eq!(wal.frame_count(), 1);
    assert_eq!(wal.newest_commit(), Some(1));
}

#[test]
fn test_snapshot_reads_pick_newest_visible_version() {
    let temp = TempDatabase::new().unwrap();
    let mut wal = open_wal(&temp);
    for txn in 1..=3u64 {
        wal.append(txn, 7, &image(txn as u8)).unwrap();
        wal.commit(txn).unwrap();
    }

    assert_eq!(wal.read_page(7, 0).unwrap(), None);
    assert_eq!(wal.read_page(7, 1).unwrap(), Some(image(1)));
    assert_eq!(wal.read_page(7, 2).unwrap(), Some(image(2)));
    assert_eq!(wal.read_page(7, 10).unwrap(), Some(image(3)));
    assert_eq!(wal.latest_image(7).unwrap(), Some(image(3)));
}

#[test]
fn test_rollback_truncates_pending_frames() {
    let temp = TempDatabase::new().unwrap();
    let mut wal = open_wal(&temp);
    wal.append(1, 2, &image(1)).unwrap();
    wal.commit(1).unwrap();
    let committed_len = wal_len(&temp);

    wal.append(2, 2, &image(2)).unwrap();
    wal.append(2, 3, &image(2)).unwrap();
    wal.rollback(2).unwrap();
    wal.rollback(2).unwrap();

    assert_eq!(wal_len(&temp), committed_len);
    assert_eq!(wal.latest_image(2).unwrap(), Some(image(1)));
    assert_eq!(wal.latest_image(3).unwrap(), None);
}

#[test]
fn test_interleaved_transactions_conflict() {
    let temp = TempDatabase::new().unwrap();
    let mut wal = open_wal(&temp);
    wal.append(1, 2, &image(1)).unwrap();
    assert!(matches!(wal.append(2, 3, &image(2)), Err(DatabaseError::Conflict)));
}

#[test]
fn test_recovery_keeps_committed_and_drops_uncommitted() {
    let temp = TempDatabase::new().unwrap();
    {
        let mut wal = open_wal(&temp);
        wal.append(1, 2, &image(1)).unwrap();
        wal.commit(1).unwrap();
        wal.append(2, 2, &image(2)).unwrap();
        // No commit frame: simulated crash
    }

    let mut wal = Wal::open(temp.wal_path(), PAGE_SIZE).unwrap();
    let recovered = wal.recover().unwrap();
    assert_eq!(recovered.into_iter().collect::<Vec<_>>(), vec![1]);
    assert_eq!(wal.latest_image(2).unwrap(), Some(image(1)));
    assert_eq!(wal_len(&temp), WAL_HEADER_SIZE + FRAME_HEADER_SIZE * 2 + PAGE_SIZE as u64);

    // The log accepts new transactions after the cut
    wal.append(2, 4, &image(4)).unwrap();
    wal.commit(2).unwrap();
    assert_eq!(wal.latest_image(4).unwrap(), Some(image(4)));
}

#[test]
fn test_torn_commit_frame_is_discarded() {
    let temp = TempDatabase::new().unwrap();
    {
        let mut wal = open_wal(&temp);
        wal.append(1, 2, &image(1)).unwrap();
        wal.commit(1).unwrap();
        wal.append(2, 2, &image(2)).unwrap();
        wal.commit(2).unwrap();
    }
    let file = OpenOptions::new().write(true).open(temp.wal_path()).unwrap();
    file.set_len(wal_len(&temp) - 3).unwrap();

    let mut wal = Wal::open(temp.wal_path(), PAGE_SIZE).unwrap();
    let recovered = wal.recover().unwrap();
    assert!(recovered.contains(&1));
    assert!(!recovered.contains(&2));
    assert_eq!(wal.latest_image(2).unwrap(), Some(image(1)));
}

#[test]
fn test_checksum_mismatch_stops_recovery() {
    let temp = TempDatabase::new().unwrap();
    {
        let mut wal = open_wal(&temp);
        wal.append(1, 2, &image(1)).unwrap();
        wal.commit(1).unwrap();
    }
    // Flip one payload byte of the only page frame
    let mut bytes = std::fs::read(temp.wal_path()).unwrap();
    let payload_at = (WAL_HEADER_SIZE + FRAME_HEADER_SIZE) as usize + 10;
    bytes[payload_at] ^= 0xFF;
    std::fs::write(temp.wal_path(), &bytes).unwrap();

    let mut wal = Wal::open(temp.wal_path(), PAGE_SIZE).unwrap();
    assert!(wal.recover().unwrap().is_empty());
    assert_eq!(wal.latest_image(2).unwrap(), None);
    assert_eq!(wal_len(&temp), WAL_HEADER_SIZE);
}

#[test]
fn test_page_size_mismatch_is_rejected() {
    let temp = TempDatabase::new().unwrap();
    drop(open_wal(&temp));
    assert!(matches!(
        Wal::open(temp.wal_path(), PAGE_SIZE * 2),
        Err(DatabaseError::CorruptedWal { .. })
    ));
}

#[test]
fn test_checkpoint_moves_images_into_main_file() {
    let temp = TempDatabase::new().unwrap();
    let salt = [9u8; 16];
    let key = derive_key(b"secret", &salt, MIN_KDF_ITERATIONS).unwrap();
    let mut store = PageStore::create(
        temp.path(),
        PageCodec::new(&key),
        FileHeader::new(PAGE_SIZE, MIN_KDF_ITERATIONS, salt),
    )
    .unwrap();

    let mut wal = open_wal(&temp);
    wal.append(1, 0, &image(1)).unwrap();
    wal.append(1, 1, &image(1)).unwrap();
    wal.commit(1).unwrap();
    wal.append(2, 1, &image(2)).unwrap();
    wal.commit(2).unwrap();

    let stats = wal.checkpoint(&mut store).unwrap();
    assert_eq!(stats.frames, 3);
    assert_eq!(stats.pages, 2);
    assert_eq!(wal.checkpoint_seq(), 1);
    assert_eq!(wal.frame_count(), 0);
    assert_eq!(wal.newest_commit(), None);
    assert_eq!(wal_len(&temp), WAL_HEADER_SIZE);

    assert_eq!(store.read_image(1).unwrap(), image(2));
    assert_eq!(store.read_image(0).unwrap(), image(1));

    // Checkpoint sequence survives reopening
    drop(wal);
    let wal = open_wal(&temp);
    assert_eq!(wal.checkpoint_seq(), 1);
}

#[test]
fn test_checkpoint_refused_while_transaction_pending() {
    let temp = TempDatabase::new().unwrap();
    let salt = [9u8; 16];
    let key = derive_key(b"secret", &salt, MIN_KDF_ITERATIONS).unwrap();
    let mut store = PageStore::create(
        temp.path(),
        PageCodec::new(&key),
        FileHeader::new(PAGE_SIZE, MIN_KDF_ITERATIONS, salt),
    )
    .unwrap();
    let mut wal = open_wal(&temp);
    wal.append(1, 1, &image(1)).unwrap();
    assert!(matches!(wal.checkpoint(&mut store), Err(DatabaseError::Conflict)));
}
