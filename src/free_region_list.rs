use std::sync::Arc;

use crate::{
    region::{HeapRegion, NO_REGION, UNKNOWN_NODE},
    region_manager::HeapRegionTable,
    region_set::next_set_id,
};

/// Doubly linked list of free regions kept sorted by region index.
///
/// Links are region indices stored inside the regions, so the list itself only holds the
/// ends. Every mutating method requires the caller to own the list exclusively, which in
/// the heap means holding the region manager lock.
pub struct FreeRegionList {
    name: &'static str,
    id: u32,
    table: Arc<HeapRegionTable>,
    head: u32,
    tail: u32,
    /// Last region added by `add_ordered`, where the next ordered insertion starts searching.
    last: u32,
    length: usize,
    node_counts: Vec<usize>,
}

impl FreeRegionList {
    pub fn new(name: &'static str, table: Arc<HeapRegionTable>, num_nodes: usize) -> Self {
        Self {
            name,
            id: next_set_id(),
            table,
            head: NO_REGION,
            tail: NO_REGION,
            last: NO_REGION,
            length: 0,
            node_counts: vec![0; num_nodes.max(1)],
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn length(&self) -> usize {
        self.length
    }
    pub fn is_empty(&self) -> bool {
        self.head == NO_REGION
    }
    pub fn head(&self) -> Option<u32> {
        (self.head != NO_REGION).then(|| self.head)
    }
    pub fn tail(&self) -> Option<u32> {
        (self.tail != NO_REGION).then(|| self.tail)
    }

    pub fn length_in_node(&self, node: u32) -> usize {
        self.node_counts.get(node as usize).copied().unwrap_or(0)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.table
            .get(index)
            .map(|r| r.containing_set() == self.id)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> FreeRegionListIter<'_> {
        FreeRegionListIter {
            list: self,
            cur: self.head,
        }
    }

    fn count_node(&mut self, region: &HeapRegion, delta: isize) {
        let node = region.node_index();
        if node != UNKNOWN_NODE {
            if let Some(count) = self.node_counts.get_mut(node as usize) {
                *count = (*count as isize + delta) as usize;
            }
        }
    }

    fn before_add(&mut self, region: &HeapRegion) {
        debug_assert!(
            region.containing_set() == 0,
            "[{}] {:?} is already in set {}",
            self.name,
            region,
            region.containing_set()
        );
        debug_assert!(
            region.is_free() && region.is_empty(),
            "[{}] {:?} is not an empty free region",
            self.name,
            region
        );
        debug_assert!(region.next() == NO_REGION && region.prev() == NO_REGION);
        region.set_containing_set(self.id);
        self.count_node(region, 1);
        self.length += 1;
    }

    fn after_remove(&mut self, region: &HeapRegion) {
        debug_assert_eq!(region.containing_set(), self.id);
        region.set_containing_set(0);
        self.count_node(region, -1);
        self.length -= 1;
    }

    /// Insert the region keeping the list sorted. Inserting in ascending order is linear
    /// overall because the search resumes from the previous insertion point.
    pub fn add_ordered(&mut self, index: u32) {
        let table = self.table.clone();
        let region = table.at(index);
        self.before_add(region);

        if self.head == NO_REGION {
            self.head = index;
            self.tail = index;
        } else {
            let mut cur = if self.last != NO_REGION && self.last < index {
                self.last
            } else {
                self.head
            };
            while cur != NO_REGION && cur < index {
                cur = table.at(cur).next();
            }
            debug_assert_ne!(cur, index, "[{}] region {} added twice", self.name, index);
            if cur == NO_REGION {
                region.set_prev(self.tail);
                table.at(self.tail).set_next(index);
                self.tail = index;
            } else {
                let cur_region = table.at(cur);
                let prev = cur_region.prev();
                region.set_next(cur);
                region.set_prev(prev);
                cur_region.set_prev(index);
                if prev == NO_REGION {
                    self.head = index;
                } else {
                    table.at(prev).set_next(index);
                }
            }
        }
        self.last = index;
    }

    /// Append a region whose index is above every region in the list.
    pub fn add_to_tail(&mut self, index: u32) {
        debug_assert!(
            self.tail == NO_REGION || self.tail < index,
            "[{}] region {} would break the ordering, tail is {}",
            self.name,
            index,
            self.tail
        );
        let table = self.table.clone();
        let region = table.at(index);
        self.before_add(region);
        if self.tail == NO_REGION {
            self.head = index;
        } else {
            table.at(self.tail).set_next(index);
            region.set_prev(self.tail);
        }
        self.tail = index;
    }

    /// Move every region of `other` into this list, leaving `other` empty.
    pub fn add_ordered_list(&mut self, other: &mut FreeRegionList) {
        debug_assert!(Arc::ptr_eq(&self.table, &other.table));
        if other.is_empty() {
            return;
        }
        if self.is_empty() || self.tail < other.head {
            while let Some(index) = other.remove_region(true) {
                self.add_to_tail(index);
            }
        } else {
            while let Some(index) = other.remove_region(true) {
                self.add_ordered(index);
            }
        }
    }

    fn unlink(&mut self, index: u32) {
        let table = self.table.clone();
        let region = table.at(index);
        let prev = region.prev();
        let next = region.next();
        if prev == NO_REGION {
            debug_assert_eq!(self.head, index);
            self.head = next;
        } else {
            table.at(prev).set_next(next);
        }
        if next == NO_REGION {
            debug_assert_eq!(self.tail, index);
            self.tail = prev;
        } else {
            table.at(next).set_prev(prev);
        }
        if self.last == index {
            self.last = NO_REGION;
        }
        region.set_prev(NO_REGION);
        region.set_next(NO_REGION);
        self.after_remove(region);
    }

    pub fn remove_region(&mut self, from_head: bool) -> Option<u32> {
        let index = if from_head { self.head } else { self.tail };
        if index == NO_REGION {
            return None;
        }
        self.unlink(index);
        Some(index)
    }

    /// Take a region whose node matches `node`, looking at most `max_search_depth` regions
    /// from the chosen end. Gives back the end region itself when nothing matched.
    pub fn remove_region_with_node_index(
        &mut self,
        from_head: bool,
        node: u32,
        max_search_depth: usize,
    ) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        if node == UNKNOWN_NODE || self.node_counts.len() <= 1 {
            return self.remove_region(from_head);
        }
        let mut cur = if from_head { self.head } else { self.tail };
        let mut depth = 0;
        while cur != NO_REGION && depth < max_search_depth {
            let region = self.table.at(cur);
            if region.node_index() == node {
                self.unlink(cur);
                return Some(cur);
            }
            cur = if from_head {
                region.next()
            } else {
                region.prev()
            };
            depth += 1;
        }
        self.remove_region(from_head)
    }

    /// Remove the `num` consecutive regions starting at `first`. All of them must be in
    /// this list.
    pub fn remove_starting_at(&mut self, first: u32, num: usize) {
        debug_assert!(num >= 1 && num <= self.length);
        let mut cur = first;
        for i in 0..num {
            debug_assert_eq!(cur, first + i as u32, "[{}] run is not contiguous", self.name);
            debug_assert!(
                self.contains(cur),
                "[{}] region {} is not in the list",
                self.name,
                cur
            );
            let next = self.table.at(cur).next();
            self.unlink(cur);
            cur = next;
        }
    }

    /// Walk the whole list checking links, ordering, membership and counts.
    pub fn verify(&self) {
        let mut count = 0;
        let mut prev = NO_REGION;
        let mut cur = self.head;
        let mut node_counts = vec![0usize; self.node_counts.len()];
        while cur != NO_REGION {
            let region = self.table.at(cur);
            assert_eq!(region.prev(), prev, "[{}] broken back link at {}", self.name, cur);
            assert!(
                prev == NO_REGION || prev < cur,
                "[{}] unsorted: {} before {}",
                self.name,
                prev,
                cur
            );
            assert_eq!(region.containing_set(), self.id);
            assert!(region.is_free() && region.is_empty(), "{:?}", region);
            if let Some(count) = node_counts.get_mut(region.node_index() as usize) {
                *count += 1;
            }
            count += 1;
            assert!(count <= self.length, "[{}] cycle or bad length", self.name);
            prev = cur;
            cur = region.next();
        }
        assert_eq!(prev, self.tail, "[{}] tail mismatch", self.name);
        assert_eq!(count, self.length, "[{}] length mismatch", self.name);
        assert_eq!(node_counts, self.node_counts, "[{}] node counts", self.name);
    }
}

pub struct FreeRegionListIter<'a> {
    list: &'a FreeRegionList,
    cur: u32,
}

impl<'a> Iterator for FreeRegionListIter<'a> {
    type Item = u32;
    fn next(&mut self) -> Option<u32> {
        if self.cur == NO_REGION {
            return None;
        }
        let index = self.cur;
        self.cur = self.list.table.at(index).next();
        Some(index)
    }
}

impl std::fmt::Debug for FreeRegionList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeRegionList")
            .field("name", &self.name)
            .field("length", &self.length)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .finish()
    }
}
