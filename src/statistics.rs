use crate::utils::{formatted_size, percent_of};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    pub reserved: usize,
    pub committed: usize,
    pub used: usize,
    pub region_size: usize,
    pub max_regions: usize,
    pub active_regions: usize,
    pub inactive_regions: usize,
    pub free_regions: usize,
    pub eden_regions: usize,
    pub survivor_regions: usize,
    pub old_regions: usize,
    pub humongous_regions: usize,
    pub archive_regions: usize,
    /// Per worker PLAB sizes in words.
    pub young_plab_size: usize,
    pub old_plab_size: usize,
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Committed: {} of {} reserved",
            formatted_size(self.committed),
            formatted_size(self.reserved)
        )?;
        writeln!(
            f,
            "  Used: {} ({:.2}% of committed)",
            formatted_size(self.used),
            percent_of(self.used, self.committed)
        )?;
        writeln!(
            f,
            "  Regions: {} x {}, {} active, {} inactive, {} free",
            self.max_regions,
            formatted_size(self.region_size),
            self.active_regions,
            self.inactive_regions,
            self.free_regions
        )?;
        writeln!(
            f,
            "  Eden: {}, survivor: {}, old: {}, humongous: {}, archive: {}",
            self.eden_regions,
            self.survivor_regions,
            self.old_regions,
            self.humongous_regions,
            self.archive_regions
        )?;
        writeln!(
            f,
            "  PLAB size: young {} words, old {} words",
            self.young_plab_size, self.old_plab_size
        )?;
        Ok(())
    }
}
