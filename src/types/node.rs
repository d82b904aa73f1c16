use crate::types::{
    PAGE_HEADER_SIZE, PageId,
    entry::{InteriorEntry, LeafEntry},
    error::DatabaseError,
    page::{Page, PageType},
};

/// A B-tree node decoded from one page; the variant follows the page type byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Interior(InteriorNode),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafNode {
    pub entries: Vec<LeafEntry>,
    pub next_leaf: Option<PageId>,
}

/// `keys[i]` separates `children[i]` (keys below it) from `children[i + 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteriorNode {
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<PageId>,
}

/// Bytes of cell area (slots + cells) available in a page of `size` bytes.
pub fn node_capacity(size: usize) -> usize {
    size - PAGE_HEADER_SIZE
}

impl Node {
    pub fn from_bytes(page_id: PageId, bytes: &[u8]) -> Result<Self, DatabaseError> {
        let page = Page::from_bytes(page_id, bytes)?;
        match page.page_type {
            PageType::Leaf => {
                let entries = page
                    .cells()
                    .map(LeafEntry::from_bytes)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::Leaf(LeafNode {
                    entries,
                    next_leaf: page.right_pointer,
                }))
            }
            PageType::Interior => {
                let mut keys = Vec::with_capacity(page.cell_count as usize);
                let mut children = Vec::with_capacity(page.cell_count as usize + 1);
                for cell in page.cells() {
                    let entry = InteriorEntry::from_bytes(cell)?;
                    keys.push(entry.key);
                    children.push(entry.child);
                }
                let right_most = page.right_pointer.ok_or_else(|| {
                    DatabaseError::corrupted_page(page_id, "interior page without right child")
                })?;
                children.push(right_most);
                Ok(Node::Interior(InteriorNode { keys, children }))
            }
            PageType::Free => Err(DatabaseError::corrupted_page(
                page_id,
                "free page reached from the tree",
            )),
        }
    }

    pub fn to_bytes(&self, page_id: PageId, size: usize) -> Result<Vec<u8>, DatabaseError> {
        let page = match self {
            Node::Leaf(leaf) => {
                let mut page = Page::new(page_id, PageType::Leaf, size);
                page.right_pointer = leaf.next_leaf;
                for entry in &leaf.entries {
                    page.insert_cell(&entry.to_bytes())?;
                }
                page
            }
            Node::Interior(interior) => {
                let (right_most, rest) = interior.children.split_last().ok_or_else(|| {
                    DatabaseError::corrupted_page(page_id, "interior node without children")
                })?;
                if rest.len() != interior.keys.len() {
                    return Err(DatabaseError::corrupted_page(
                        page_id,
                        "interior node key/child count mismatch",
                    ));
                }
                let mut page = Page::new(page_id, PageType::Interior, size);
                page.right_pointer = Some(*right_most);
                for (key, child) in interior.keys.iter().zip(rest) {
                    page.insert_cell(&InteriorEntry::new(key.clone(), *child).to_bytes())?;
                }
                page
            }
        };
        Ok(page.to_bytes())
    }

    pub fn fill(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.fill(),
            Node::Interior(interior) => interior.fill(),
        }
    }
}

impl LeafNode {
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
    }

    pub fn fill(&self) -> usize {
        self.entries.iter().map(LeafEntry::footprint).sum()
    }

    /// Split at the byte midpoint. `self` keeps the lower half.
    pub fn split_off_half(&mut self) -> LeafNode {
        let sizes: Vec<usize> = self.entries.iter().map(LeafEntry::footprint).collect();
        let at = half_point(&sizes, 1, self.entries.len().saturating_sub(1));
        LeafNode {
            entries: self.entries.split_off(at),
            next_leaf: self.next_leaf,
        }
    }
}

impl InteriorNode {
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|separator| separator.as_slice() <= key)
    }

    pub fn fill(&self) -> usize {
        self.keys.iter().map(|key| InteriorEntry::footprint(key)).sum()
    }

    /// Split at the byte midpoint, returning the separator moved up.
    pub fn split_off_half(&mut self) -> Option<(Vec<u8>, InteriorNode)> {
        if self.keys.len() < 3 {
            return None;
        }
        let sizes: Vec<usize> = self.keys.iter().map(|key| InteriorEntry::footprint(key)).collect();
        let mid = half_point(&sizes, 1, self.keys.len() - 2);
        let right_keys = self.keys.split_off(mid + 1);
        let separator = self.keys.pop()?;
        let right_children = self.children.split_off(mid + 1);
        Some((
            separator,
            InteriorNode {
                keys: right_keys,
                children: right_children,
            },
        ))
    }
}

/// First index whose prefix sum reaches half the total, clamped to `[lo, hi]`.
fn half_point(sizes: &[usize], lo: usize, hi: usize) -> usize {
    let total: usize = sizes.iter().sum();
    let mut accumulated = 0;
    let mut at = sizes.len();
    for (i, size) in sizes.iter().enumerate() {
        accumulated += size;
        if accumulated * 2 >= total {
            at = i + 1;
            break;
        }
    }
    at.clamp(lo, hi.max(lo))
}
