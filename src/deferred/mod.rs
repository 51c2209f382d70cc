/*
 * Deferred execution
 *
 * Three escalating levels of "do this later, not right now": DPCs run at
 * DISPATCH_LEVEL on whichever CPU posted them (or a target CPU), APCs run
 * in a specific thread's context once it's back below APC_LEVEL,
 * workqueues run on an ordinary worker thread that can block, and timers
 * are just DPCs/workqueue items scheduled for a future tick.
 */

pub mod apc;
pub mod dpc;
pub mod timer;
pub mod workqueue;

pub fn init() {
    timer::init();
    workqueue::init();
    log::info!(target: "deferred", "deferred execution subsystem initialized");
}
