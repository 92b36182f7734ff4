use crate::region::UNKNOWN_NODE;

/// NUMA topology as seen by the heap. With a single node everything maps to node 0 and no
/// system call is ever made.
pub struct HeapNuma {
    num_nodes: u32,
    region_size: usize,
    page_size: usize,
}

#[cfg(target_os = "linux")]
const MPOL_PREFERRED: libc::c_long = 1;

impl HeapNuma {
    pub fn new(num_nodes: usize, region_size: usize, page_size: usize) -> Self {
        Self {
            num_nodes: num_nodes.clamp(1, 64) as u32,
            region_size,
            page_size,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.num_nodes > 1
    }

    pub fn num_active_nodes(&self) -> usize {
        self.num_nodes as usize
    }

    /// Node the region at `region_index` should be backed by. Regions are striped
    /// round-robin over the nodes.
    pub fn preferred_node_index_for_index(&self, region_index: u32) -> u32 {
        if !self.is_enabled() {
            return 0;
        }
        region_index % self.num_nodes
    }

    /// Node of the CPU the calling thread is running on.
    pub fn index_of_current_thread(&self) -> u32 {
        if !self.is_enabled() {
            return 0;
        }
        current_cpu().map_or(UNKNOWN_NODE, |cpu| cpu % self.num_nodes)
    }

    /// Ask the OS to back `[addr, addr + size)` with memory of the preferred node of
    /// `region_index`. Failures only cost locality and are logged.
    pub fn request_memory_on_node(&self, addr: *mut u8, size: usize, region_index: u32) {
        if !self.is_enabled() {
            return;
        }
        let node = self.preferred_node_index_for_index(region_index);
        debug_assert!(size % self.page_size == 0 && size <= self.region_size);
        if !bind_to_node(addr, size, node) {
            log::debug!(
                "failed to bind region {} at {:p} to node {}",
                region_index,
                addr,
                node
            );
        }
    }
}

#[cfg(target_os = "linux")]
fn current_cpu() -> Option<u32> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        None
    } else {
        Some(cpu as u32)
    }
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> Option<u32> {
    None
}

#[cfg(target_os = "linux")]
fn bind_to_node(addr: *mut u8, size: usize, node: u32) -> bool {
    let nodemask: libc::c_ulong = 1 << node;
    let res = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr as libc::c_long,
            size as libc::c_ulong,
            MPOL_PREFERRED,
            &nodemask as *const libc::c_ulong,
            (std::mem::size_of::<libc::c_ulong>() * 8) as libc::c_ulong,
            0 as libc::c_uint,
        )
    };
    res == 0
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_addr: *mut u8, _size: usize, _node: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_maps_everything_to_zero() {
        let numa = HeapNuma::new(1, 1 << 20, 4096);
        assert!(!numa.is_enabled());
        assert_eq!(numa.preferred_node_index_for_index(17), 0);
        assert_eq!(numa.index_of_current_thread(), 0);
    }

    #[test]
    fn regions_are_striped_over_nodes() {
        let numa = HeapNuma::new(3, 1 << 20, 4096);
        let nodes: Vec<u32> = (0..6).map(|i| numa.preferred_node_index_for_index(i)).collect();
        assert_eq!(nodes, vec![0, 1, 2, 0, 1, 2]);
        let node = numa.index_of_current_thread();
        assert!(node < 3 || node == UNKNOWN_NODE);
    }
}
