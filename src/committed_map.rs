use bit_vec::BitVec;

/// Commit state of every reserved region.
///
/// A region is in exactly one of three states:
///
/// - uncommitted: no memory behind it;
/// - active: committed and usable, either free or in use;
/// - inactive: still committed but logically given back by a shrink, waiting for the
///   uncommit service. Expansion reactivates these before committing anything new.
///
/// Transitions are done by the region manager under its lock. Committing or uncommitting
/// the actual memory happens outside of that lock, guarded by the uncommit lock.
pub struct HeapRegionCommittedMap {
    active: BitVec,
    inactive: BitVec,
    num_active: usize,
    num_inactive: usize,
}

impl HeapRegionCommittedMap {
    pub fn new(num_regions: usize) -> Self {
        Self {
            active: BitVec::from_elem(num_regions, false),
            inactive: BitVec::from_elem(num_regions, false),
            num_active: 0,
            num_inactive: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.active.len()
    }
    pub fn num_active(&self) -> usize {
        self.num_active
    }
    pub fn num_inactive(&self) -> usize {
        self.num_inactive
    }

    pub fn active(&self, index: usize) -> bool {
        self.active.get(index).unwrap_or(false)
    }
    pub fn inactive(&self, index: usize) -> bool {
        self.inactive.get(index).unwrap_or(false)
    }
    pub fn committed(&self, index: usize) -> bool {
        self.active(index) || self.inactive(index)
    }

    /// Uncommitted to active.
    pub fn activate(&mut self, start: usize, end: usize) {
        for i in start..end {
            debug_assert!(!self.committed(i), "region {} already committed", i);
            self.active.set(i, true);
        }
        self.num_active += end - start;
    }

    /// Inactive to active.
    pub fn reactivate(&mut self, start: usize, end: usize) {
        for i in start..end {
            debug_assert!(self.inactive(i), "region {} is not inactive", i);
            self.inactive.set(i, false);
            self.active.set(i, true);
        }
        self.num_inactive -= end - start;
        self.num_active += end - start;
    }

    /// Active to inactive.
    pub fn deactivate(&mut self, start: usize, end: usize) {
        for i in start..end {
            debug_assert!(self.active(i), "region {} is not active", i);
            self.active.set(i, false);
            self.inactive.set(i, true);
        }
        self.num_active -= end - start;
        self.num_inactive += end - start;
    }

    /// Inactive to uncommitted.
    pub fn uncommit(&mut self, start: usize, end: usize) {
        for i in start..end {
            debug_assert!(self.inactive(i), "region {} is not inactive", i);
            self.inactive.set(i, false);
        }
        self.num_inactive -= end - start;
    }

    fn next_range(&self, offset: usize, pred: impl Fn(usize) -> bool) -> (usize, usize) {
        let len = self.max_length();
        let mut start = offset;
        while start < len && !pred(start) {
            start += 1;
        }
        let mut end = start;
        while end < len && pred(end) {
            end += 1;
        }
        (start, end)
    }

    /// Next run of active regions at or after `offset` as `[start, end)`. Empty when
    /// `start == end`.
    pub fn next_active_range(&self, offset: usize) -> (usize, usize) {
        self.next_range(offset, |i| self.active(i))
    }

    pub fn next_inactive_range(&self, offset: usize) -> (usize, usize) {
        self.next_range(offset, |i| self.inactive(i))
    }

    /// Next run of uncommitted regions.
    pub fn next_committable_range(&self, offset: usize) -> (usize, usize) {
        self.next_range(offset, |i| !self.committed(i))
    }

    pub fn verify(&self) {
        let active = self.active.iter().filter(|x| *x).count();
        let inactive = self.inactive.iter().filter(|x| *x).count();
        assert_eq!(active, self.num_active);
        assert_eq!(inactive, self.num_inactive);
        for i in 0..self.max_length() {
            assert!(!(self.active(i) && self.inactive(i)), "region {} in two states", i);
        }
    }
}
