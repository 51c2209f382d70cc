/*
 * Scheduler domains
 *
 * Mirrors `topology.rs`'s level tree: one domain per topology node, each
 * holding the CPUs in that node and a parent index, so load balancing
 * walks groups bottom-up (SMT siblings first, then shared-cache groups,
 * then NUMA/package) the same way `topology::steal_order` does for a
 * single CPU. Built once at `sched::init` and treated as read-only after.
 */

use alloc::vec::Vec;

use crate::cpumask::CpuMask;
use crate::topology::{self, Level};

pub struct DomainGroup {
    pub level: Level,
    pub cpus: CpuMask,
    /// Index into the flat domain vec, or `None` for the top-level domain.
    pub parent: Option<usize>,
}

static DOMAINS: spin::Once<Vec<DomainGroup>> = spin::Once::new();

pub fn init(ncpus: usize) {
    DOMAINS.call_once(|| build(ncpus));
}

fn build(ncpus: usize) -> Vec<DomainGroup> {
    topology::with(|topo| {
        let mut groups = Vec::new();
        let mut level_start = Vec::new();
        for level in topo.levels() {
            level_start.push(groups.len());
            for node in &level.nodes {
                groups.push(DomainGroup {
                    level: level.level,
                    cpus: node.cpus.clone(),
                    parent: None,
                });
            }
        }
        // Wire parent links: a node's parent is whichever group one level up
        // has its cpus as a subset.
        for li in 1..level_start.len() {
            let (lo, hi) = (level_start[li - 1], level_start.get(li).copied().unwrap_or(groups.len()));
            let (parent_lo, parent_hi) = (level_start[li], level_start.get(li + 1).copied().unwrap_or(groups.len()));
            for child_idx in lo..hi {
                for parent_idx in parent_lo..parent_hi {
                    let is_subset = groups[child_idx].cpus.is_subset_of(&groups[parent_idx].cpus);
                    if is_subset {
                        groups[child_idx].parent = Some(parent_idx);
                        break;
                    }
                }
            }
        }
        if groups.is_empty() {
            let mut all = CpuMask::new(ncpus.max(1));
            for c in 0..ncpus.max(1) {
                all.set(c);
            }
            groups.push(DomainGroup { level: Level::Package, cpus: all, parent: None });
        }
        groups
    })
}

pub fn groups() -> &'static [DomainGroup] {
    DOMAINS.call_once(|| build(1))
}

/// The smallest domain group containing `cpu`, used by the work-steal
/// controller to widen its search radius one level at a time.
pub fn containing(cpu: usize) -> Option<&'static DomainGroup> {
    groups().iter().find(|g| g.cpus.test(cpu))
}

/// The group at exactly `level` that contains `cpu`. Unlike `containing`,
/// which stops at the first (smallest) match, this lets the steal
/// controller look up each level of the hierarchy in turn.
pub fn at_level(cpu: usize, level: Level) -> Option<&'static DomainGroup> {
    groups().iter().find(|g| g.level == level && g.cpus.test(cpu))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_topology_yields_one_package_domain() {
        let ncpus = topology::with(|t| t.ncpus());
        let groups = build(ncpus);
        assert!(!groups.is_empty());
        assert!(groups.iter().any(|g| g.level == Level::Package));
    }
}
