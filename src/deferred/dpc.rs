/*
 * Deferred Procedure Calls
 *
 * Per-CPU, lock-free-ish queue of short callbacks posted from interrupt
 * context and run at DISPATCH_LEVEL, drained whenever `irql::lower` takes
 * a CPU back below DISPATCH (see `irql.rs`). DPCs never block and never
 * touch a specific thread's state directly — that's what APCs are for.
 *
 * The queue itself is a small `Spinlock<Vec<Dpc>>` rather than a literal
 * lock-free SPSC ring: DPCs can be posted from any CPU (a driver ISR on
 * CPU 2 queuing work for CPU 0), so it's MPSC in practice, and the
 * teacher's own preference for `spin::Mutex`-guarded `Vec`s over
 * hand-rolled lock-free structures elsewhere in this core carries over.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::sched::CpuId;

pub struct Dpc {
    routine: Box<dyn FnOnce() + Send>,
}

impl Dpc {
    pub fn new(routine: impl FnOnce() + Send + 'static) -> Self {
        Self { routine: Box::new(routine) }
    }
}

struct PerCpuQueue {
    queue: spin::Mutex<Vec<Dpc>>,
}

impl PerCpuQueue {
    const fn new() -> Self {
        Self { queue: spin::Mutex::new(Vec::new()) }
    }
}

const MAX_CPUS: usize = 256;
static QUEUES: [PerCpuQueue; MAX_CPUS] = {
    const INIT: PerCpuQueue = PerCpuQueue::new();
    [INIT; MAX_CPUS]
};

/// Posts a DPC onto `cpu`'s queue. Safe to call from interrupt context;
/// does not itself run the routine or touch IRQL.
pub fn queue_on(cpu: CpuId, dpc: Dpc) {
    let idx = (cpu.as_usize()).min(MAX_CPUS - 1);
    QUEUES[idx].queue.lock().push(dpc);
}

pub fn queue_current_cpu(dpc: Dpc) {
    queue_on(crate::sched::current_cpu(), dpc);
}

/// Runs every DPC queued for the calling CPU. Called from `irql::lower`
/// when IRQL drops below DISPATCH_LEVEL; the IRQL is still at DISPATCH
/// for the duration (the caller hasn't stored the lowered value yet), so
/// routines here must not block.
pub fn drain_current_cpu() {
    let idx = crate::sched::current_cpu().as_usize().min(MAX_CPUS - 1);
    loop {
        let dpc = QUEUES[idx].queue.lock().pop();
        match dpc {
            Some(dpc) => (dpc.routine)(),
            None => break,
        }
    }
}

pub fn pending_count(cpu: CpuId) -> usize {
    let idx = cpu.as_usize().min(MAX_CPUS - 1);
    QUEUES[idx].queue.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn queued_dpc_runs_on_drain() {
        HITS.store(0, Ordering::SeqCst);
        queue_on(CpuId(7), Dpc::new(|| {
            HITS.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(pending_count(CpuId(7)), 1);
        let idx = 7usize;
        loop {
            let dpc = QUEUES[idx].queue.lock().pop();
            match dpc {
                Some(dpc) => (dpc.routine)(),
                None => break,
            }
        }
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert_eq!(pending_count(CpuId(7)), 0);
    }
}
