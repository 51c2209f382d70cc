/*
 * CPU topology
 *
 * SMT -> CORE -> LLC -> NUMA -> PACKAGE. Cores register themselves into
 * levels at boot; each level exposes groups with a CPU mask and an idle
 * mask. A node's `cpus` is always the union of its children's `cpus`, and
 * `idle` is always a subset of `cpus`.
 */

use alloc::vec::Vec;

use crate::boot::BootInfo;
use crate::cpumask::CpuMask;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Smt,
    Core,
    Llc,
    Numa,
    Package,
}

pub const LEVELS: [Level; 5] = [Level::Smt, Level::Core, Level::Llc, Level::Numa, Level::Package];

#[derive(Debug, Copy, Clone)]
pub struct CacheDescriptor {
    pub cache_level: u8,
    pub size_bytes: u64,
    pub line_size: u32,
    pub cores_sharing: u32,
}

pub struct TopologyNode {
    pub id: u32,
    pub level: Level,
    pub cpus: CpuMask,
    pub idle: CpuMask,
    pub cache: Option<CacheDescriptor>,
}

impl TopologyNode {
    fn new(id: u32, level: Level, ncpus: usize) -> Self {
        Self {
            id,
            level,
            cpus: CpuMask::new(ncpus),
            idle: CpuMask::new(ncpus),
            cache: None,
        }
    }

    pub fn mark_idle(&mut self, cpu: usize) {
        debug_assert!(self.cpus.test(cpu));
        self.idle.set(cpu);
    }

    pub fn mark_busy(&mut self, cpu: usize) {
        self.idle.clear(cpu);
    }

    pub fn idle_count(&self) -> u32 {
        self.idle.count()
    }
}

/// One level of the topology, holding every node (group) at that level.
pub struct TopologyLevel {
    pub level: Level,
    pub nodes: Vec<TopologyNode>,
}

pub struct Topology {
    ncpus: usize,
    levels: Vec<TopologyLevel>,
}

impl Topology {
    /// Builds a flat, single-package topology: every CPU is its own SMT/CORE
    /// leaf, sharing one LLC/NUMA/PACKAGE node. Real hardware enumeration
    /// (CPUID leaf 4/0x1F, ACPI SRAT) replaces this in a fuller bring-up;
    /// the shape here is what the core needs to exercise work stealing and
    /// domain fallback without real hardware topology discovery wired in.
    pub fn flat(ncpus: usize) -> Self {
        let mut levels = Vec::with_capacity(LEVELS.len());
        for &level in LEVELS.iter() {
            let nodes = if level == Level::Smt || level == Level::Core {
                (0..ncpus)
                    .map(|cpu| {
                        let mut node = TopologyNode::new(cpu as u32, level, ncpus);
                        node.cpus.set(cpu);
                        node
                    })
                    .collect()
            } else {
                let mut node = TopologyNode::new(0, level, ncpus);
                for cpu in 0..ncpus {
                    node.cpus.set(cpu);
                }
                alloc::vec![node]
            };
            levels.push(TopologyLevel { level, nodes });
        }
        Self { ncpus, levels }
    }

    pub fn ncpus(&self) -> usize {
        self.ncpus
    }

    pub fn level(&self, level: Level) -> &TopologyLevel {
        self.levels.iter().find(|l| l.level == level).expect("all levels present")
    }

    pub fn level_mut(&mut self, level: Level) -> &mut TopologyLevel {
        self.levels.iter_mut().find(|l| l.level == level).expect("all levels present")
    }

    /// All levels, outermost-last (SMT first, PACKAGE last), for callers
    /// that need to walk the whole tree rather than one named level.
    pub fn levels(&self) -> &[TopologyLevel] {
        &self.levels
    }

    /// Order of preference for work-stealing victim search.
    pub fn steal_order() -> [Level; 5] {
        [Level::Smt, Level::Core, Level::Llc, Level::Numa, Level::Package]
    }

    pub fn mark_cpu_idle(&mut self, cpu: usize) {
        for level in self.levels.iter_mut() {
            for node in level.nodes.iter_mut() {
                if node.cpus.test(cpu) {
                    node.mark_idle(cpu);
                }
            }
        }
    }

    pub fn mark_cpu_busy(&mut self, cpu: usize) {
        for level in self.levels.iter_mut() {
            for node in level.nodes.iter_mut() {
                if node.cpus.test(cpu) {
                    node.mark_busy(cpu);
                }
            }
        }
    }
}

static TOPOLOGY: spin::Once<spin::Mutex<Topology>> = spin::Once::new();

pub fn init(boot_info: &BootInfo) {
    let ncpus = boot_info.cpu_count();
    TOPOLOGY.call_once(|| spin::Mutex::new(Topology::flat(ncpus)));
    log::info!(target: "topo", "topology initialized for {} cpus", ncpus);
}

pub fn with<R>(f: impl FnOnce(&mut Topology) -> R) -> R {
    let t = TOPOLOGY.call_once(|| spin::Mutex::new(Topology::flat(1)));
    f(&mut t.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_topology_unions_children_into_parents() {
        let topo = Topology::flat(4);
        let numa = topo.level(Level::Numa);
        assert_eq!(numa.nodes.len(), 1);
        assert_eq!(numa.nodes[0].cpus.count(), 4);
    }

    #[test]
    fn idle_is_subset_of_cpus_after_marks() {
        let mut topo = Topology::flat(2);
        topo.mark_cpu_idle(0);
        for level in [Level::Smt, Level::Core, Level::Llc, Level::Numa, Level::Package] {
            let l = topo.level(level);
            for node in &l.nodes {
                assert!(node.idle.is_subset_of(&node.cpus));
            }
        }
    }
}
