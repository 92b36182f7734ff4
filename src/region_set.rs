use std::sync::atomic::{AtomicU32, Ordering};

use crate::region::HeapRegion;

static NEXT_SET_ID: AtomicU32 = AtomicU32::new(1);

/// Ids are only used to check region ownership, 0 means "in no set".
pub(crate) fn next_set_id() -> u32 {
    NEXT_SET_ID.fetch_add(1, Ordering::Relaxed)
}

/// A counted set of regions. Membership is recorded on the region itself so that moving a
/// region into a second set without removing it first trips an assertion.
pub struct HeapRegionSet {
    id: u32,
    name: &'static str,
    length: usize,
    checker: fn(&HeapRegion) -> bool,
}

impl HeapRegionSet {
    pub fn new(name: &'static str, checker: fn(&HeapRegion) -> bool) -> Self {
        Self {
            id: next_set_id(),
            name,
            length: 0,
            checker,
        }
    }

    pub fn eden() -> Self {
        Self::new("Eden Set", HeapRegion::is_eden)
    }
    pub fn survivor() -> Self {
        Self::new("Survivor Set", HeapRegion::is_survivor)
    }
    pub fn old() -> Self {
        Self::new("Old Set", HeapRegion::is_old)
    }
    pub fn humongous() -> Self {
        Self::new("Humongous Set", HeapRegion::is_humongous)
    }
    pub fn archive() -> Self {
        Self::new("Archive Set", HeapRegion::is_archive)
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
        self.length == 0
    }

    pub fn add(&mut self, region: &HeapRegion) {
        debug_assert!(
            region.containing_set() == 0,
            "[{}] {:?} is already in set {}",
            self.name,
            region,
            region.containing_set()
        );
        debug_assert!((self.checker)(region), "[{}] wrong region type for {:?}", self.name, region);
        region.set_containing_set(self.id);
        self.length += 1;
    }

    pub fn remove(&mut self, region: &HeapRegion) {
        debug_assert!(
            region.containing_set() == self.id,
            "[{}] {:?} is not a member",
            self.name,
            region
        );
        debug_assert!(self.length > 0);
        region.set_containing_set(0);
        self.length -= 1;
    }

    pub fn contains(&self, region: &HeapRegion) -> bool {
        region.containing_set() == self.id
    }
}

impl std::fmt::Debug for HeapRegionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}): {} regions", self.name, self.id, self.length)
    }
}
