use std::collections::BTreeMap;

use rand::{Rng, SeedableRng, rngs::StdRng};
use sandi::{
    storage::{bplus_tree::BPlusTree, scan::Scan},
    types::{error::DatabaseError, max_record_size},
    utils::mock::MemoryPages,
};

// Plaintext capacity of a 1 KiB encrypted page
const CAPACITY: usize = 996;

fn create_tree() -> (MemoryPages, BPlusTree) {
    let mut pages = MemoryPages::new(CAPACITY);
    let tree = BPlusTree::create(&mut pages).unwrap();
    (pages, tree)
}

fn key(i: u32) -> Vec<u8> {
    format!("key_{:08}", i).into_bytes()
}

fn collect(scan: Scan<'_, MemoryPages>) -> Vec<(Vec<u8>, Vec<u8>)> {
    scan.collect::<Result<Vec<_>, _>>().unwrap()
}

#[test]
fn test_empty_tree() {
    let (pages, tree) = create_tree();
    assert_eq!(tree.get(&pages, b"missing").unwrap(), None);
    assert!(collect(tree.scan(&pages, None, None)).is_empty());

    let stats = tree.check(&pages).unwrap();
    assert_eq!(stats.height, 1);
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.leaf_pages, 1);
}

#[test]
fn test_put_get_and_replace() {
    let (mut pages, mut tree) = create_tree();
    tree.put(&mut pages, b"apple", b"red").unwrap();
    tree.put(&mut pages, b"banana", b"yellow").unwrap();
    tree.put(&mut pages, b"apple", b"green").unwrap();

    assert_eq!(tree.get(&pages, b"apple").unwrap(), Some(b"green".to_vec()));
    assert_eq!(tree.get(&pages, b"banana").unwrap(), Some(b"yellow".to_vec()));
    assert_eq!(tree.get(&pages, b"cherry").unwrap(), None);
    assert_eq!(tree.check(&pages).unwrap().entries, 2);
}

#[test]
fn test_empty_key_and_value_are_allowed() {
    let (mut pages, mut tree) = create_tree();
    tree.put(&mut pages, b"", b"").unwrap();
    assert_eq!(tree.get(&pages, b"").unwrap(), Some(Vec::new()));
    assert!(tree.delete(&mut pages, b"").unwrap());
}

#[test]
fn test_delete_reports_presence() {
    let (mut pages, mut tree) = create_tree();
    tree.put(&mut pages, b"k", b"v").unwrap();
    assert!(tree.delete(&mut pages, b"k").unwrap());
    assert!(!tree.delete(&mut pages, b"k").unwrap());
    assert_eq!(tree.get(&pages, b"k").unwrap(), None);
}

#[test]
fn test_record_size_limit() {
    let (mut pages, mut tree) = create_tree();
    let max = max_record_size(CAPACITY);

    let fits = vec![7u8; max - 4];
    tree.put(&mut pages, b"abcd", &fits).unwrap();

    let too_big = vec![7u8; max - 3];
    assert!(matches!(
        tree.put(&mut pages, b"abcd", &too_big),
        Err(DatabaseError::RecordTooLarge { .. })
    ));
    assert_eq!(tree.get(&pages, b"abcd").unwrap(), Some(fits));
}

#[test]
fn test_sequential_inserts_grow_the_tree() {
    let (mut pages, mut tree) = create_tree();
    let value = vec![b'v'; 100];
    for i in 0..2000 {
        tree.put(&mut pages, &key(i), &value).unwrap();
    }

    let stats = tree.check(&pages).unwrap();
    assert_eq!(stats.entries, 2000);
    assert!(stats.height >= 3, "height {} too small", stats.height);
    assert_eq!(stats.page_ids.len(), pages.live_pages());

    for i in (0..2000).step_by(97) {
        assert_eq!(tree.get(&pages, &key(i)).unwrap(), Some(value.clone()));
    }
}

#[test]
fn test_deleting_everything_collapses_to_one_leaf() {
    let (mut pages, mut tree) = create_tree();
    for i in 0..1500 {
        tree.put(&mut pages, &key(i), &[1u8; 60]).unwrap();
    }
    assert!(tree.check(&pages).unwrap().height > 1);

    for i in (0..1500).rev() {
        assert!(tree.delete(&mut pages, &key(i)).unwrap());
    }
    let stats = tree.check(&pages).unwrap();
    assert_eq!(stats.height, 1);
    assert_eq!(stats.entries, 0);
    assert_eq!(pages.live_pages(), 1);
}

#[test]
fn test_random_operations_match_model() {
    let mut rng = StdRng::seed_from_u64(0x5A4D1);
    let (mut pages, mut tree) = create_tree();
    let mut model = BTreeMap::new();

    for step in 0..6000 {
        let k = key(rng.gen_range(0..800));
        if rng.gen_bool(0.6) {
            let len = rng.gen_range(0..150);
            let value: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            tree.put(&mut pages, &k, &value).unwrap();
            model.insert(k, value);
        } else {
            let existed = tree.delete(&mut pages, &k).unwrap();
            assert_eq!(existed, model.remove(&k).is_some());
        }

        if step % 500 == 0 {
            let stats = tree.check(&pages).unwrap();
            assert_eq!(stats.entries as usize, model.len());
            assert_eq!(stats.page_ids.len(), pages.live_pages(), "pages leaked");
        }
    }

    let scanned = collect(tree.scan(&pages, None, None));
    let expected: Vec<_> = model.into_iter().collect();
    assert_eq!(scanned, expected);
}

#[test]
fn test_scan_bounds_are_half_open() {
    let (mut pages, mut tree) = create_tree();
    for i in 0..500 {
        tree.put(&mut pages, &key(i), &i.to_le_bytes()).unwrap();
    }

    let range = collect(tree.scan(&pages, Some(key(100).as_slice()), Some(key(300).as_slice())));
    assert_eq!(range.len(), 200);
    assert_eq!(range.first().unwrap().0, key(100));
    assert_eq!(range.last().unwrap().0, key(299));
    assert!(range.windows(2).all(|pair| pair[0].0 < pair[1].0));

    // Bounds need not be existing keys
    let tail = collect(tree.scan(&pages, Some(b"key_00000450x".as_slice()), None));
    assert_eq!(tail.len(), 49);

    let head = collect(tree.scan(&pages, None, Some(b"key_00000010".as_slice())));
    assert_eq!(head.len(), 10);

    assert!(collect(tree.scan(&pages, Some(key(300).as_slice()), Some(key(300).as_slice()))).is_empty());
    assert!(collect(tree.scan(&pages, Some(key(300).as_slice()), Some(key(100).as_slice()))).is_empty());
}

#[test]
fn test_scan_restart() {
    let (mut pages, mut tree) = create_tree();
    for i in 0..300 {
        tree.put(&mut pages, &key(i), b"x").unwrap();
    }
    let mut scan = tree.scan(&pages, Some(key(10).as_slice()), None);
    let first: Vec<_> = scan.by_ref().take(50).map(Result::unwrap).collect();
    assert_eq!(first[0].0, key(10));

    scan.restart();
    let again = scan.next().unwrap().unwrap();
    assert_eq!(again.0, key(10));
    assert_eq!(scan.count(), 289);
}

#[test]
fn test_corrupted_child_pointer_is_reported() {
    let (mut pages, mut tree) = create_tree();
    for i in 0..200 {
        tree.put(&mut pages, &key(i), &[0u8; 50]).unwrap();
    }
    // Point the tree at a page that is not a node
    let broken = BPlusTree::new(tree.root_page_id + 10_000);
    assert!(matches!(
        broken.get(&pages, &key(1)),
        Err(DatabaseError::CorruptedPage { .. })
    ));
    assert!(broken.check(&pages).is_err());
}
