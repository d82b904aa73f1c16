use sandi::{
    storage::{PageWrite, freelist, header::DatabaseHeader},
    types::error::DatabaseError,
    utils::mock::MemoryPages,
};

const CAPACITY: usize = 996;

fn header_with_pages(page_count: u64) -> DatabaseHeader {
    DatabaseHeader {
        page_count,
        ..DatabaseHeader::new()
    }
}

fn free(pages: &mut MemoryPages, header: &DatabaseHeader, page_id: u64) -> DatabaseHeader {
    let (bytes, updated) = freelist::push(header, page_id, CAPACITY).unwrap();
    pages.write_page(page_id, bytes).unwrap();
    updated
}

#[test]
fn test_pop_extends_high_water_mark_when_empty() {
    let pages = MemoryPages::new(CAPACITY);
    let header = DatabaseHeader::new();
    let (page_id, updated) = freelist::pop(&pages, &header, 100).unwrap();
    assert_eq!(page_id, 2);
    assert_eq!(updated.page_count, 3);
    assert_eq!(updated.freelist_count, 0);
}

#[test]
fn test_freed_pages_are_reused_last_in_first_out() {
    let mut pages = MemoryPages::new(CAPACITY);
    let mut header = header_with_pages(6);
    for page_id in [2, 3, 4] {
        header = free(&mut pages, &header, page_id);
    }
    assert_eq!(header.freelist_count, 3);
    assert_eq!(freelist::walk(&pages, &header).unwrap(), vec![4, 3, 2]);

    let (first, header) = freelist::pop(&pages, &header, 100).unwrap();
    let (second, header) = freelist::pop(&pages, &header, 100).unwrap();
    assert_eq!((first, second), (4, 3));
    assert_eq!(header.freelist_head, 2);
    assert_eq!(header.freelist_count, 1);
    assert_eq!(header.page_count, 6);
}

#[test]
fn test_allocation_stops_at_max_pages() {
    let pages = MemoryPages::new(CAPACITY);
    let header = header_with_pages(10);
    assert!(matches!(
        freelist::pop(&pages, &header, 10),
        Err(DatabaseError::OutOfSpace { max_pages: 10 })
    ));
}

#[test]
fn test_freeing_header_or_unknown_page_is_refused() {
    let header = header_with_pages(4);
    assert!(freelist::push(&header, 0, CAPACITY).is_err());
    assert!(freelist::push(&header, 4, CAPACITY).is_err());
}

#[test]
fn test_walk_detects_count_mismatch() {
    let mut pages = MemoryPages::new(CAPACITY);
    let header = free(&mut pages, &header_with_pages(4), 3);
    let lying = DatabaseHeader {
        freelist_count: 2,
        ..header.clone()
    };
    assert!(matches!(
        freelist::walk(&pages, &lying),
        Err(DatabaseError::CorruptedDatabase { .. })
    ));

    // A cycle shows up as a list longer than recorded
    let (bytes, _) = freelist::push(&header, 3, CAPACITY).unwrap();
    pages.write_page(3, bytes).unwrap();
    assert!(freelist::walk(&pages, &header).is_err());
}
