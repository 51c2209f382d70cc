/*
 * Substrate Kernel Core
 *
 * This crate is the execution substrate of a preemptive x86-64 kernel:
 * memory management, the IRQL discipline, the thread scheduler, the
 * synchronization primitives built on top of it, deferred execution, RCU,
 * TLB shootdown, and the block I/O scheduler/cache. Device drivers,
 * filesystems, ACPI, and userspace are collaborators outside this crate.
 *
 * `#![cfg_attr(not(test), no_std)]` mirrors the pattern used by the
 * `linked_list_allocator` dependency itself: built for the bare-metal target
 * this crate is `no_std`, but under `cargo test` on the host it gets `std`
 * and a real test harness, so the pure-logic modules below can carry
 * `#[cfg(test)]` unit tests instead of only boot-invoked integration checks.
 */

#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![allow(dead_code)]

extern crate alloc;

pub mod arch;
pub mod block;
pub mod boot;
pub mod cpumask;
pub mod deferred;
pub mod global;
pub mod irql;
pub mod mm;
pub mod rcu;
pub mod sched;
pub mod sync;
pub mod tlb;
pub mod topology;
pub mod utils;

#[cfg(not(test))]
#[global_allocator]
pub(crate) static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}

/// Runs every core-init stage in boot order. Called once from `kstart` on
/// the BSP after the arch layer (GDT/IDT) is already live.
pub fn init_core(boot_info: &boot::BootInfo) {
    utils::logger::init(true);
    log::info!(target: "core", "substrate core initializing");

    global::init(boot_info);
    mm::init(boot_info);
    topology::init(boot_info);
    sched::init();
    deferred::init();
    rcu::init();
    tlb::init();
    block::init();

    global::set_bootstage(global::BootStage::Late);
    log::info!(target: "core", "substrate core initialized");
}
