use std::collections::{HashSet, VecDeque};

use crate::{
    storage::{PageRead, bplus_tree::BPlusTree},
    types::{PageId, entry::LeafEntry, error::DatabaseError, node::Node},
};

/// Lazy range cursor over `[low, high)`, one leaf at a time.
///
/// Reads go through the page view it was created from, so a cursor opened
/// inside a transaction sees exactly that transaction's snapshot.
pub struct Scan<'a, P: PageRead + ?Sized> {
    pages: &'a P,
    tree: BPlusTree,
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
    buffer: VecDeque<LeafEntry>,
    next_leaf: Option<PageId>,
    visited: HashSet<PageId>,
    started: bool,
    done: bool,
}

impl<'a, P: PageRead + ?Sized> Scan<'a, P> {
    pub(crate) fn new(pages: &'a P, tree: BPlusTree, low: Option<&[u8]>, high: Option<&[u8]>) -> Self {
        let empty = matches!((low, high), (Some(low), Some(high)) if low >= high);
        Self {
            pages,
            tree,
            low: low.map(<[u8]>::to_vec),
            high: high.map(<[u8]>::to_vec),
            buffer: VecDeque::new(),
            next_leaf: None,
            visited: HashSet::new(),
            started: false,
            done: empty,
        }
    }

    /// Rewind to the first record at or after `low`.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.next_leaf = None;
        self.visited.clear();
        self.started = false;
        self.done = matches!((&self.low, &self.high), (Some(low), Some(high)) if low >= high);
    }

    fn seek(&mut self) -> Result<(), DatabaseError> {
        let (page_id, leaf) = self.tree.find_leaf(self.pages, self.low.as_deref())?;
        let low = self.low.as_deref();
        self.buffer = leaf
            .entries
            .into_iter()
            .filter(|entry| low.is_none_or(|low| entry.key.as_slice() >= low))
            .collect();
        self.next_leaf = leaf.next_leaf;
        self.visited.insert(page_id);
        Ok(())
    }

    fn advance(&mut self, page_id: PageId) -> Result<(), DatabaseError> {
        if !self.visited.insert(page_id) {
            return Err(DatabaseError::corrupted_page(page_id, "cycle in leaf chain"));
        }
        match self.tree.load(self.pages, page_id)? {
            Node::Leaf(leaf) => {
                self.buffer = leaf.entries.into();
                self.next_leaf = leaf.next_leaf;
                Ok(())
            }
            Node::Interior(_) => Err(DatabaseError::corrupted_page(
                page_id,
                "leaf chain points at an interior page",
            )),
        }
    }

    fn next_entry(&mut self) -> Result<Option<LeafEntry>, DatabaseError> {
        if !self.started {
            self.started = true;
            self.seek()?;
        }
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                if self.high.as_deref().is_some_and(|high| entry.key.as_slice() >= high) {
                    return Ok(None);
                }
                return Ok(Some(entry));
            }
            match self.next_leaf {
                Some(page_id) => self.advance(page_id)?,
                None => return Ok(None),
            }
        }
    }
}

impl<P: PageRead + ?Sized> Iterator for Scan<'_, P> {
    type Item = Result<(Vec<u8>, Vec<u8>), DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok((entry.key, entry.value))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
