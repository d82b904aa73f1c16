use std::collections::BTreeSet;

use crate::{
    storage::{PageRead, PageWrite, scan::Scan},
    types::{
        PageId,
        entry::LeafEntry,
        error::DatabaseError,
        max_record_size,
        node::{InteriorNode, LeafNode, Node, node_capacity},
    },
};

/// Deeper than this can only mean a cycle in the page graph.
pub(crate) const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Op<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

impl Op<'_> {
    fn key(&self) -> &[u8] {
        match self {
            Op::Put { key, .. } | Op::Delete { key } => key,
        }
    }
}

/// What a modified subtree reports to its parent.
#[derive(Debug, Default)]
struct Change {
    split: Option<(Vec<u8>, PageId)>,
    underflow: bool,
    existed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub entries: u64,
    pub leaf_pages: u64,
    pub interior_pages: u64,
    pub page_ids: BTreeSet<PageId>,
}

/// B+ tree over byte keys. Only the root page id lives here; every node is
/// read from and written to the page view passed into each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BPlusTree {
    pub root_page_id: PageId,
}

impl BPlusTree {
    pub fn new(root_page_id: PageId) -> Self {
        Self { root_page_id }
    }

    /// Allocate an empty root leaf.
    pub fn create<P: PageWrite + ?Sized>(pages: &mut P) -> Result<Self, DatabaseError> {
        let root_page_id = pages.allocate_page()?;
        let tree = Self { root_page_id };
        tree.store(pages, root_page_id, &Node::Leaf(LeafNode::default()))?;
        Ok(tree)
    }

    pub fn get<P: PageRead + ?Sized>(&self, pages: &P, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let leaf = self.find_leaf(pages, Some(key))?.1;
        Ok(leaf
            .search(key)
            .ok()
            .map(|i| leaf.entries[i].value.clone()))
    }

    /// Insert `key`, replacing the value if it already exists.
    pub fn put<P: PageWrite + ?Sized>(
        &mut self,
        pages: &mut P,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), DatabaseError> {
        let max = max_record_size(pages.page_capacity());
        let size = key.len() + value.len();
        if size > max {
            return Err(DatabaseError::RecordTooLarge { size, max });
        }
        self.apply(pages, Op::Put { key, value })?;
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete<P: PageWrite + ?Sized>(&mut self, pages: &mut P, key: &[u8]) -> Result<bool, DatabaseError> {
        Ok(self.apply(pages, Op::Delete { key })?.existed)
    }

    /// Ordered records in `[low, high)`; `None` leaves that side unbounded.
    pub fn scan<'a, P: PageRead + ?Sized>(
        &self,
        pages: &'a P,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Scan<'a, P> {
        Scan::new(pages, *self, low, high)
    }

    fn apply<P: PageWrite + ?Sized>(&mut self, pages: &mut P, op: Op<'_>) -> Result<Change, DatabaseError> {
        let change = self.modify(pages, self.root_page_id, op, 0)?;

        if let Some((separator, right)) = &change.split {
            // Only place the tree grows
            let new_root = pages.allocate_page()?;
            let root = InteriorNode {
                keys: vec![separator.clone()],
                children: vec![self.root_page_id, *right],
            };
            self.store(pages, new_root, &Node::Interior(root))?;
            self.root_page_id = new_root;
        } else if change.underflow {
            // Only place the tree shrinks
            if let Node::Interior(root) = self.load(pages, self.root_page_id)? {
                if root.keys.is_empty() {
                    let old_root = self.root_page_id;
                    self.root_page_id = root.children[0];
                    pages.free_page(old_root)?;
                }
            }
        }
        Ok(change)
    }

    fn modify<P: PageWrite + ?Sized>(
        &self,
        pages: &mut P,
        page_id: PageId,
        op: Op<'_>,
        depth: usize,
    ) -> Result<Change, DatabaseError> {
        if depth > MAX_TREE_DEPTH {
            return Err(DatabaseError::corrupted_page(page_id, "tree deeper than any valid tree"));
        }
        let capacity = node_capacity(pages.page_capacity());

        match self.load(pages, page_id)? {
            Node::Leaf(mut leaf) => {
                let mut change = Change::default();
                match op {
                    Op::Put { key, value } => match leaf.search(key) {
                        Ok(i) => {
                            leaf.entries[i].value = value.to_vec();
                            change.existed = true;
                        }
                        Err(i) => leaf.entries.insert(i, LeafEntry::new(key, value)),
                    },
                    Op::Delete { key } => match leaf.search(key) {
                        Ok(i) => {
                            leaf.entries.remove(i);
                            change.existed = true;
                        }
                        Err(_) => return Ok(change),
                    },
                }

                if leaf.fill() > capacity {
                    let right_id = pages.allocate_page()?;
                    let right = leaf.split_off_half();
                    leaf.next_leaf = Some(right_id);
                    let separator = right.entries[0].key.clone();
                    self.store(pages, page_id, &Node::Leaf(leaf))?;
                    self.store(pages, right_id, &Node::Leaf(right))?;
                    change.split = Some((separator, right_id));
                } else {
                    change.underflow = leaf.fill() < capacity / 4;
                    self.store(pages, page_id, &Node::Leaf(leaf))?;
                }
                Ok(change)
            }
            Node::Interior(mut node) => {
                let index = node.child_index(op.key());
                let child = self.modify(pages, node.children[index], op, depth + 1)?;
                let mut change = Change {
                    existed: child.existed,
                    ..Change::default()
                };

                if let Some((separator, right)) = child.split {
                    node.keys.insert(index, separator);
                    node.children.insert(index + 1, right);
                } else if child.underflow {
                    self.rebalance(pages, &mut node, index, page_id)?;
                } else {
                    return Ok(change);
                }

                if node.fill() > capacity {
                    let (separator, right) = node.split_off_half().ok_or_else(|| {
                        DatabaseError::corrupted_page(page_id, "interior node too small to split")
                    })?;
                    let right_id = pages.allocate_page()?;
                    self.store(pages, page_id, &Node::Interior(node))?;
                    self.store(pages, right_id, &Node::Interior(right))?;
                    change.split = Some((separator, right_id));
                } else {
                    change.underflow = node.keys.is_empty() || node.fill() < capacity / 4;
                    self.store(pages, page_id, &Node::Interior(node))?;
                }
                Ok(change)
            }
        }
    }

    /// Fix the underflowing child at `index` by merging it with a sibling, or
    /// by redistributing when the two do not fit in one page.
    fn rebalance<P: PageWrite + ?Sized>(
        &self,
        pages: &mut P,
        parent: &mut InteriorNode,
        index: usize,
        parent_id: PageId,
    ) -> Result<(), DatabaseError> {
        if parent.children.len() < 2 {
            return Err(DatabaseError::corrupted_page(parent_id, "interior node with a single child"));
        }
        let capacity = node_capacity(pages.page_capacity());
        let left_index = if index > 0 { index - 1 } else { index };
        let left_id = parent.children[left_index];
        let right_id = parent.children[left_index + 1];

        match (self.load(pages, left_id)?, self.load(pages, right_id)?) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.entries.extend(right.entries);
                left.next_leaf = right.next_leaf;
                if left.fill() <= capacity {
                    self.store(pages, left_id, &Node::Leaf(left))?;
                    pages.free_page(right_id)?;
                    parent.keys.remove(left_index);
                    parent.children.remove(left_index + 1);
                } else {
                    let right = left.split_off_half();
                    left.next_leaf = Some(right_id);
                    parent.keys[left_index] = right.entries[0].key.clone();
                    self.store(pages, left_id, &Node::Leaf(left))?;
                    self.store(pages, right_id, &Node::Leaf(right))?;
                }
            }
            (Node::Interior(mut left), Node::Interior(right)) => {
                left.keys.push(parent.keys[left_index].clone());
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                if left.fill() <= capacity {
                    self.store(pages, left_id, &Node::Interior(left))?;
                    pages.free_page(right_id)?;
                    parent.keys.remove(left_index);
                    parent.children.remove(left_index + 1);
                } else {
                    let (separator, right) = left.split_off_half().ok_or_else(|| {
                        DatabaseError::corrupted_page(left_id, "interior siblings too small to redistribute")
                    })?;
                    parent.keys[left_index] = separator;
                    self.store(pages, left_id, &Node::Interior(left))?;
                    self.store(pages, right_id, &Node::Interior(right))?;
                }
            }
            _ => {
                return Err(DatabaseError::corrupted_page(
                    parent_id,
                    "sibling nodes at different depths",
                ));
            }
        }
        Ok(())
    }

    /// Descend to the leaf that would hold `key` (left-most leaf for `None`).
    pub(crate) fn find_leaf<P: PageRead + ?Sized>(
        &self,
        pages: &P,
        key: Option<&[u8]>,
    ) -> Result<(PageId, LeafNode), DatabaseError> {
        let mut page_id = self.root_page_id;
        for _ in 0..=MAX_TREE_DEPTH {
            match self.load(pages, page_id)? {
                Node::Leaf(leaf) => return Ok((page_id, leaf)),
                Node::Interior(node) => {
                    let index = key.map_or(0, |key| node.child_index(key));
                    page_id = node.children[index];
                }
            }
        }
        Err(DatabaseError::corrupted_page(page_id, "tree deeper than any valid tree"))
    }

    pub(crate) fn load<P: PageRead + ?Sized>(&self, pages: &P, page_id: PageId) -> Result<Node, DatabaseError> {
        Node::from_bytes(page_id, &pages.read_page(page_id)?)
    }

    fn store<P: PageWrite + ?Sized>(&self, pages: &mut P, page_id: PageId, node: &Node) -> Result<(), DatabaseError> {
        let bytes = node.to_bytes(page_id, pages.page_capacity())?;
        pages.write_page(page_id, bytes)
    }

    /// Walk the whole tree and verify its structural invariants.
    pub fn check<P: PageRead + ?Sized>(&self, pages: &P) -> Result<TreeStats, DatabaseError> {
        let mut stats = TreeStats::default();
        let mut leaves = Vec::new();
        let height = self.check_node(pages, self.root_page_id, None, None, true, 0, &mut stats, &mut leaves)?;
        stats.height = height;

        for (i, (page_id, next_leaf)) in leaves.iter().enumerate() {
            let expected = leaves.get(i + 1).map(|(next_id, _)| *next_id);
            if *next_leaf != expected {
                return Err(DatabaseError::corrupted_page(
                    *page_id,
                    format!("leaf links to {:?}, expected {:?}", next_leaf, expected),
                ));
            }
        }
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node<P: PageRead + ?Sized>(
        &self,
        pages: &P,
        page_id: PageId,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        is_root: bool,
        depth: usize,
        stats: &mut TreeStats,
        leaves: &mut Vec<(PageId, Option<PageId>)>,
    ) -> Result<usize, DatabaseError> {
        if depth > MAX_TREE_DEPTH || !stats.page_ids.insert(page_id) {
            return Err(DatabaseError::corrupted_page(page_id, "page reachable twice"));
        }
        let capacity = node_capacity(pages.page_capacity());
        let node = self.load(pages, page_id)?;
        if node.fill() > capacity {
            return Err(DatabaseError::corrupted_page(page_id, "node overflows its page"));
        }
        let in_bounds = |key: &[u8]| low.is_none_or(|low| key >= low) && high.is_none_or(|high| key < high);

        match node {
            Node::Leaf(leaf) => {
                if leaf.entries.is_empty() && !is_root {
                    return Err(DatabaseError::corrupted_page(page_id, "empty non-root leaf"));
                }
                for pair in leaf.entries.windows(2) {
                    if pair[0].key >= pair[1].key {
                        return Err(DatabaseError::corrupted_page(page_id, "leaf keys out of order"));
                    }
                }
                if let Some(entry) = leaf.entries.iter().find(|e| !in_bounds(e.key.as_slice())) {
                    return Err(DatabaseError::corrupted_page(
                        page_id,
                        format!("key {:?} outside its separator range", entry.key),
                    ));
                }
                stats.entries += leaf.entries.len() as u64;
                stats.leaf_pages += 1;
                leaves.push((page_id, leaf.next_leaf));
                Ok(1)
            }
            Node::Interior(node) => {
                if node.keys.is_empty() {
                    return Err(DatabaseError::corrupted_page(page_id, "interior node below minimum fanout"));
                }
                for pair in node.keys.windows(2) {
                    if pair[0] >= pair[1] {
                        return Err(DatabaseError::corrupted_page(page_id, "separators out of order"));
                    }
                }
                if node.keys.iter().any(|key| !in_bounds(key.as_slice())) {
                    return Err(DatabaseError::corrupted_page(page_id, "separator outside its range"));
                }
                stats.interior_pages += 1;

                let mut height = None;
                for (i, child) in node.children.iter().enumerate() {
                    let child_low = if i == 0 { low } else { Some(node.keys[i - 1].as_slice()) };
                    let child_high = node.keys.get(i).map(Vec::as_slice).or(high);
                    let child_height =
                        self.check_node(pages, *child, child_low, child_high, false, depth + 1, stats, leaves)?;
                    if *height.get_or_insert(child_height) != child_height {
                        return Err(DatabaseError::corrupted_page(page_id, "leaves at different depths"));
                    }
                }
                Ok(height.unwrap_or(0) + 1)
            }
        }
    }
}
