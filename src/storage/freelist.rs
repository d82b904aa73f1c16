//! Free-list threaded through unused pages.
//!
//! The header holds the head; each free page stores the next free page in its
//! right pointer. Both operations are O(1) and return the updated header
//! rather than mutating shared state, so they stay inside the calling
//! transaction.

use crate::{
    storage::{PageRead, header::DatabaseHeader},
    types::{
        PageId,
        error::DatabaseError,
        page::{Page, PageType},
    },
};

/// Take a page for reuse, or extend the high-water mark when none is free.
pub fn pop<P: PageRead + ?Sized>(
    pages: &P,
    header: &DatabaseHeader,
    max_pages: u64,
) -> Result<(PageId, DatabaseHeader), DatabaseError> {
    let mut updated = header.clone();
    if header.freelist_head != 0 {
        let page_id = header.freelist_head;
        let next = next_free(pages, header, page_id)?;
        updated.freelist_head = next.unwrap_or(0);
        updated.freelist_count = header.freelist_count.saturating_sub(1);
        return Ok((page_id, updated));
    }

    if header.page_count >= max_pages {
        return Err(DatabaseError::OutOfSpace {
            max_pages,
        });
    }
    updated.page_count += 1;
    Ok((header.page_count, updated))
}

/// Return `page_id` to the free-list. Yields the free page image to store.
pub fn push(
    header: &DatabaseHeader,
    page_id: PageId,
    capacity: usize,
) -> Result<(Vec<u8>, DatabaseHeader), DatabaseError> {
    if page_id == 0 || page_id >= header.page_count {
        return Err(DatabaseError::corrupted_page(
            page_id,
            format!("cannot free page outside 1..{}", header.page_count),
        ));
    }
    let mut page = Page::new(page_id, PageType::Free, capacity);
    page.right_pointer = match header.freelist_head {
        0 => None,
        head => Some(head),
    };

    let mut updated = header.clone();
    updated.freelist_head = page_id;
    updated.freelist_count += 1;
    Ok((page.to_bytes(), updated))
}

/// All free page ids in list order.
pub fn walk<P: PageRead + ?Sized>(
    pages: &P,
    header: &DatabaseHeader,
) -> Result<Vec<PageId>, DatabaseError> {
    let mut free_pages = Vec::with_capacity(header.freelist_count as usize);
    let mut current = match header.freelist_head {
        0 => None,
        head => Some(head),
    };
    while let Some(page_id) = current {
        if free_pages.len() as u64 >= header.freelist_count {
            return Err(DatabaseError::CorruptedDatabase {
                reason: format!(
                    "free-list longer than its recorded {} pages",
                    header.freelist_count
                ),
            });
        }
        free_pages.push(page_id);
        current = next_free(pages, header, page_id)?;
    }
    if free_pages.len() as u64 != header.freelist_count {
        return Err(DatabaseError::CorruptedDatabase {
            reason: format!(
                "free-list has {} pages, header records {}",
                free_pages.len(),
                header.freelist_count
            ),
        });
    }
    Ok(free_pages)
}

fn next_free<P: PageRead + ?Sized>(
    pages: &P,
    header: &DatabaseHeader,
    page_id: PageId,
) -> Result<Option<PageId>, DatabaseError> {
    if page_id >= header.page_count {
        return Err(DatabaseError::corrupted_page(
            page_id,
            "free-list entry beyond the high-water mark",
        ));
    }
    let page = Page::from_bytes(page_id, &pages.read_page(page_id)?)?;
    if page.page_type != PageType::Free {
        return Err(DatabaseError::corrupted_page(
            page_id,
            format!("free-list entry is a {:?} page", page.page_type),
        ));
    }
    Ok(page.right_pointer)
}
